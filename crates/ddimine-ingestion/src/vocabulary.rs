//! Curated drug vocabulary and indication lookup.
//!
//! The vocabulary resolves brand names and synonyms to a generic name and
//! finds drug mentions in free text. Extractors use it to spot
//! co-mentioned drugs; `mine_all_known_drugs` iterates it.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use ddimine_common::evidence::canonical_drug_name;

lazy_static! {
    static ref SENTENCE_RE: Regex = Regex::new(r"[^.!?;]+(?:[.!?;]+|$)").unwrap();
}

/// One vocabulary drug: generic name plus brand names and synonyms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrugEntry {
    pub generic: String,
    pub synonyms: Vec<String>,
}

impl DrugEntry {
    pub fn new(generic: &str, synonyms: &[&str]) -> Self {
        Self {
            generic: canonical_drug_name(generic),
            synonyms: synonyms.iter().map(|s| canonical_drug_name(s)).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrugVocabulary {
    entries: Vec<DrugEntry>,
    /// Any known term (generic or synonym) to its generic name.
    terms: HashMap<String, String>,
    /// Longest term, in words.
    max_words: usize,
}

impl DrugVocabulary {
    pub fn new(entries: Vec<DrugEntry>) -> Self {
        let mut terms = HashMap::new();
        let mut max_words = 1;
        for entry in &entries {
            for term in std::iter::once(&entry.generic).chain(entry.synonyms.iter()) {
                max_words = max_words.max(term.split(' ').count());
                terms.insert(term.clone(), entry.generic.clone());
            }
        }
        Self { entries, terms, max_words }
    }

    /// Built-in list of drugs with well-documented interactions.
    pub fn curated() -> Self {
        Self::new(curated_entries())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DrugEntry] {
        &self.entries
    }

    /// Generic names in vocabulary order.
    pub fn generic_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.generic.clone()).collect()
    }

    /// Generic name for a known term, if any.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.terms.get(&canonical_drug_name(name)).map(String::as_str)
    }

    /// Resolved generic name, or the canonical form of an unknown name.
    pub fn canonical(&self, name: &str) -> String {
        self.resolve(name)
            .map(String::from)
            .unwrap_or_else(|| canonical_drug_name(name))
    }

    /// Generic names of every vocabulary drug mentioned in `text`, in order
    /// of first appearance. Longest match wins at each position.
    pub fn mentions(&self, text: &str) -> Vec<String> {
        let tokens = tokenize(text);
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut i = 0;
        while i < tokens.len() {
            let mut matched = 0;
            for n in (1..=self.max_words.min(tokens.len() - i)).rev() {
                let candidate = tokens[i..i + n].join(" ");
                if let Some(generic) = self.terms.get(&candidate) {
                    if seen.insert(generic.clone()) {
                        found.push(generic.clone());
                    }
                    matched = n;
                    break;
                }
            }
            i += matched.max(1);
        }
        found
    }

    pub fn mentions_drug(&self, text: &str, drug: &str) -> bool {
        let target = self.canonical(drug);
        if self.mentions(text).contains(&target) {
            return true;
        }
        // Drugs outside the vocabulary: whole-phrase match on tokens.
        let needle = tokenize(&target).join(" ");
        !needle.is_empty() && format!(" {} ", tokenize(text).join(" ")).contains(&format!(" {needle} "))
    }
}

impl Default for DrugVocabulary {
    fn default() -> Self {
        Self::curated()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|t| t.trim_matches('-').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Split free text into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn curated_entries() -> Vec<DrugEntry> {
    vec![
        DrugEntry::new("warfarin", &["coumadin", "jantoven"]),
        DrugEntry::new("aspirin", &["acetylsalicylic acid", "asa"]),
        DrugEntry::new("clopidogrel", &["plavix"]),
        DrugEntry::new("simvastatin", &["zocor"]),
        DrugEntry::new("atorvastatin", &["lipitor"]),
        DrugEntry::new("amiodarone", &["cordarone", "pacerone"]),
        DrugEntry::new("digoxin", &["lanoxin"]),
        DrugEntry::new("clarithromycin", &["biaxin"]),
        DrugEntry::new("erythromycin", &[]),
        DrugEntry::new("ketoconazole", &["nizoral"]),
        DrugEntry::new("fluconazole", &["diflucan"]),
        DrugEntry::new("itraconazole", &["sporanox"]),
        DrugEntry::new("rifampin", &["rifampicin", "rifadin"]),
        DrugEntry::new("phenytoin", &["dilantin"]),
        DrugEntry::new("carbamazepine", &["tegretol"]),
        DrugEntry::new("fluoxetine", &["prozac"]),
        DrugEntry::new("sertraline", &["zoloft"]),
        DrugEntry::new("tramadol", &["ultram"]),
        DrugEntry::new("linezolid", &["zyvox"]),
        DrugEntry::new("methotrexate", &["trexall"]),
        DrugEntry::new("trimethoprim", &["trimethoprim-sulfamethoxazole", "bactrim"]),
        DrugEntry::new("lisinopril", &["zestril", "prinivil"]),
        DrugEntry::new("spironolactone", &["aldactone"]),
        DrugEntry::new("potassium chloride", &["klor-con"]),
        DrugEntry::new("sildenafil", &["viagra", "revatio"]),
        DrugEntry::new("nitroglycerin", &["glyceryl trinitrate"]),
        DrugEntry::new("omeprazole", &["prilosec"]),
        DrugEntry::new("metformin", &["glucophage"]),
        DrugEntry::new("cyclosporine", &["ciclosporin", "neoral", "sandimmune"]),
        DrugEntry::new("tacrolimus", &["prograf"]),
        DrugEntry::new("doxorubicin", &["adriamycin", "doxorubicin hydrochloride"]),
        DrugEntry::new("trastuzumab", &["herceptin"]),
        DrugEntry::new("cisplatin", &["platinol"]),
        DrugEntry::new("paclitaxel", &["taxol"]),
        DrugEntry::new("ondansetron", &["zofran"]),
        DrugEntry::new("haloperidol", &["haldol"]),
        DrugEntry::new("methadone", &["dolophine"]),
        DrugEntry::new("oxycodone", &["oxycontin"]),
        DrugEntry::new("alprazolam", &["xanax"]),
        DrugEntry::new("midazolam", &["versed"]),
        DrugEntry::new("ibuprofen", &["advil", "motrin"]),
        DrugEntry::new("naproxen", &["aleve", "naprosyn"]),
        DrugEntry::new("lithium", &["lithium carbonate"]),
        DrugEntry::new("theophylline", &["theo-24"]),
        DrugEntry::new("ciprofloxacin", &["cipro"]),
    ]
}

// ── Indications ───────────────────────────────────────────────────────────────

/// Maps an indication to drugs used for it.
#[async_trait]
pub trait IndicationLookup: Send + Sync {
    /// Drug names for `indication`; empty when the indication is unknown.
    async fn drugs_for(&self, indication: &str) -> Vec<String>;
}

/// In-memory indication table.
#[derive(Debug, Clone)]
pub struct StaticIndicationLookup {
    table: BTreeMap<String, Vec<String>>,
}

impl StaticIndicationLookup {
    pub fn new(table: BTreeMap<String, Vec<String>>) -> Self {
        let table = table
            .into_iter()
            .map(|(k, v)| (canonical_drug_name(&k), v))
            .collect();
        Self { table }
    }

    pub fn builtin() -> Self {
        let rows: &[(&str, &[&str])] = &[
            ("atrial fibrillation", &["warfarin", "amiodarone", "digoxin"]),
            ("breast cancer", &["doxorubicin", "trastuzumab", "paclitaxel"]),
            ("hypertension", &["lisinopril", "spironolactone"]),
            ("depression", &["fluoxetine", "sertraline"]),
            ("hyperlipidemia", &["simvastatin", "atorvastatin"]),
            ("transplant rejection", &["cyclosporine", "tacrolimus"]),
            ("pain", &["tramadol", "oxycodone", "ibuprofen", "naproxen"]),
            ("fungal infection", &["ketoconazole", "fluconazole", "itraconazole"]),
            ("epilepsy", &["phenytoin", "carbamazepine"]),
        ];
        let table = rows
            .iter()
            .map(|(ind, drugs)| {
                (ind.to_string(), drugs.iter().map(|d| d.to_string()).collect())
            })
            .collect();
        Self::new(table)
    }

    pub fn indications(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }
}

impl Default for StaticIndicationLookup {
    fn default() -> Self {
        Self::builtin()
    }
}

#[async_trait]
impl IndicationLookup for StaticIndicationLookup {
    async fn drugs_for(&self, indication: &str) -> Vec<String> {
        self.table
            .get(&canonical_drug_name(indication))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_brand_to_generic() {
        let vocab = DrugVocabulary::curated();
        assert_eq!(vocab.resolve("Coumadin"), Some("warfarin"));
        assert_eq!(vocab.resolve("HERCEPTIN"), Some("trastuzumab"));
        assert_eq!(vocab.resolve("unobtainium"), None);
        assert_eq!(vocab.canonical("  Unobtainium  X "), "unobtainium x");
    }

    #[test]
    fn test_mentions_prefers_longest_match() {
        let vocab = DrugVocabulary::curated();
        let text = "Coadministration of potassium chloride with spironolactone, \
                    or of Adriamycin with trastuzumab, needs monitoring.";
        assert_eq!(
            vocab.mentions(text),
            vec!["potassium chloride", "spironolactone", "doxorubicin", "trastuzumab"]
        );
    }

    #[test]
    fn test_mentions_are_deduplicated() {
        let vocab = DrugVocabulary::curated();
        assert_eq!(vocab.mentions("warfarin and Coumadin and warfarin"), vec!["warfarin"]);
    }

    #[test]
    fn test_mentions_drug_outside_vocabulary() {
        let vocab = DrugVocabulary::curated();
        assert!(vocab.mentions_drug("Zanubrutinib increased exposure.", "zanubrutinib"));
        assert!(!vocab.mentions_drug("Ibrutinib increased exposure.", "zanubrutinib"));
    }

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("Avoid use. Monitor INR closely; reduce dose!  Trailing");
        assert_eq!(s, vec!["Avoid use.", "Monitor INR closely;", "reduce dose!", "Trailing"]);
    }

    #[tokio::test]
    async fn test_static_indication_lookup() {
        let lookup = StaticIndicationLookup::builtin();
        let drugs = lookup.drugs_for("Breast Cancer").await;
        assert!(drugs.contains(&"trastuzumab".to_string()));
        assert!(lookup.drugs_for("unknown condition").await.is_empty());
    }
}
