//! Keyword inference of mechanism tags and severity from evidence text.

use lazy_static::lazy_static;
use regex::Regex;

use ddimine_common::evidence::Severity;

/// A known interaction mechanism and the phrases that signal it.
#[derive(Debug)]
pub struct MechanismRule {
    pub tag: &'static str,
    pub description: &'static str,
    /// Severity assumed when the text itself gives no cue.
    pub typical_severity: Severity,
    keywords: &'static [&'static str],
}

pub const MECHANISM_RULES: &[MechanismRule] = &[
    MechanismRule {
        tag: "cyp3a4",
        description: "Altered exposure through CYP3A4 inhibition or induction",
        typical_severity: Severity::Moderate,
        keywords: &["cyp3a4", "cyp3a", "3a4 inhibit", "3a4 induc"],
    },
    MechanismRule {
        tag: "cyp2c9",
        description: "Altered exposure through CYP2C9 inhibition",
        typical_severity: Severity::Moderate,
        keywords: &["cyp2c9"],
    },
    MechanismRule {
        tag: "cyp2d6",
        description: "Altered exposure through CYP2D6 inhibition",
        typical_severity: Severity::Moderate,
        keywords: &["cyp2d6"],
    },
    MechanismRule {
        tag: "p_glycoprotein",
        description: "Altered transport through P-glycoprotein",
        typical_severity: Severity::Moderate,
        keywords: &["p-glycoprotein", "p-gp", "pgp", "abcb1"],
    },
    MechanismRule {
        tag: "qt_prolongation",
        description: "Additive QT interval prolongation",
        typical_severity: Severity::Major,
        keywords: &["qt prolong", "qtc", "qt interval", "torsade"],
    },
    MechanismRule {
        tag: "bleeding_risk",
        description: "Increased bleeding risk",
        typical_severity: Severity::Major,
        keywords: &["bleeding", "hemorrhag", "haemorrhag", "inr", "anticoagulant effect"],
    },
    MechanismRule {
        tag: "serotonin_syndrome",
        description: "Risk of serotonin syndrome",
        typical_severity: Severity::Major,
        keywords: &["serotonin syndrome", "serotonergic"],
    },
    MechanismRule {
        tag: "cardiotoxicity",
        description: "Additive cardiotoxicity",
        typical_severity: Severity::Major,
        keywords: &["cardiotox", "cardiac dysfunction", "heart failure", "lvef", "cardiomyopathy"],
    },
    MechanismRule {
        tag: "nephrotoxicity",
        description: "Additive nephrotoxicity",
        typical_severity: Severity::Moderate,
        keywords: &["nephrotox", "renal failure", "renal impairment", "kidney injury"],
    },
    MechanismRule {
        tag: "myelosuppression",
        description: "Additive bone marrow suppression",
        typical_severity: Severity::Major,
        keywords: &["myelosuppress", "neutropenia", "bone marrow", "pancytopenia"],
    },
    MechanismRule {
        tag: "cns_depression",
        description: "Additive CNS and respiratory depression",
        typical_severity: Severity::Major,
        keywords: &["cns depression", "respiratory depression", "sedation", "somnolence"],
    },
    MechanismRule {
        tag: "hyperkalemia",
        description: "Risk of hyperkalemia",
        typical_severity: Severity::Moderate,
        keywords: &["hyperkal", "serum potassium"],
    },
];

lazy_static! {
    static ref MAJOR_RE: Regex = Regex::new(
        r"(?i)\b(contraindicated|avoid|fatal|life-threatening|serious|severe|do not (co-?administer|use))\b"
    ).unwrap();
    static ref MODERATE_RE: Regex = Regex::new(
        r"(?i)\b(monitor\w*|caution|adjust\w*|dose reduction|reduce the dose|(increase|decrease)[sd]? (the )?(exposure|concentrations?|levels?|auc))\b"
    ).unwrap();
}

pub fn rule_for(tag: &str) -> Option<&'static MechanismRule> {
    MECHANISM_RULES.iter().find(|r| r.tag == tag)
}

pub fn is_known_tag(tag: &str) -> bool {
    rule_for(tag).is_some()
}

/// Tags whose keywords occur in `text`, in table order.
pub fn infer_tags(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    MECHANISM_RULES
        .iter()
        .filter(|r| r.keywords.iter().any(|k| contains_word_prefix(&lower, k)))
        .map(|r| r.tag.to_string())
        .collect()
}

/// Severity cue from wording alone.
pub fn infer_severity(text: &str) -> Option<Severity> {
    if MAJOR_RE.is_match(text) {
        Some(Severity::Major)
    } else if MODERATE_RE.is_match(text) {
        Some(Severity::Moderate)
    } else {
        None
    }
}

/// Highest typical severity among known tags.
pub fn typical_severity(tags: &[String]) -> Option<Severity> {
    tags.iter()
        .filter_map(|t| rule_for(t))
        .map(|r| r.typical_severity)
        .max()
}

pub fn default_management(severity: Severity) -> &'static str {
    match severity {
        Severity::Major    => "Avoid combination or use only with close clinical monitoring.",
        Severity::Moderate => "Monitor therapy; consider dose adjustment.",
        Severity::Minor    => "No action usually needed; be aware of the interaction.",
    }
}

/// Keyword match anchored at a word start, so "inr" does not fire inside
/// "sinrecord" while "hemorrhag" still matches "hemorrhage".
fn contains_word_prefix(haystack: &str, keyword: &str) -> bool {
    haystack.match_indices(keyword).any(|(i, _)| {
        haystack[..i]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_infer_tags() {
        let tags = infer_tags("Strong CYP3A4 inhibitors raise exposure and may cause QT prolongation.");
        assert_eq!(tags, vec!["cyp3a4", "qt_prolongation"]);
        assert_eq!(infer_tags("Monitor INR closely."), vec!["bleeding_risk"]);
        assert!(infer_tags("Nothing notable here.").is_empty());
    }

    #[test]
    fn test_word_start_anchor() {
        assert!(infer_tags("the sinrecord field").is_empty());
    }

    #[test]
    fn test_infer_severity() {
        assert_eq!(infer_severity("Concomitant use is contraindicated."), Some(Severity::Major));
        assert_eq!(infer_severity("Monitor serum levels."), Some(Severity::Moderate));
        assert_eq!(infer_severity("Increases the exposure of simvastatin."), Some(Severity::Moderate));
        assert_eq!(infer_severity("Was co-listed in a trial."), None);
    }

    #[test]
    fn test_typical_severity_takes_max() {
        let tags = vec!["cyp3a4".to_string(), "cardiotoxicity".to_string(), "made_up".to_string()];
        assert_eq!(typical_severity(&tags), Some(Severity::Major));
        assert_eq!(typical_severity(&[]), None);
    }
}
