/// Confidence scoring for DDI evidence.
/// Each source contributes a base weight; merged records aggregate with noisy-OR.

use crate::evidence::EvidenceSource;

/// Base confidence assigned to an entry from `source` before modifiers.
pub fn source_base_confidence(source: EvidenceSource) -> f64 {
    match source {
        EvidenceSource::Regulatory    => 0.85,
        EvidenceSource::ClinicalTrial => 0.60,
        EvidenceSource::Publication   => 0.45,
    }
}

/// Confidence modifiers based on study metadata.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceModifiers {
    /// Late-phase (3/4) trial or post-marketing data.
    pub is_late_phase: bool,
    /// The drug pair is named in the same sentence, not just the same document.
    pub same_sentence: bool,
    pub is_withdrawn: bool,
}

/// Compute final confidence given base weight and modifiers.
/// Returns value in [0.0, 1.0].
pub fn compute_confidence(base_weight: f64, mods: &ConfidenceModifiers) -> f64 {
    if mods.is_withdrawn {
        return 0.0;
    }

    let mut confidence = base_weight;

    if mods.is_late_phase {
        confidence *= 1.20;
    }

    // Co-mention only at document level is weak evidence of an interaction
    if !mods.same_sentence {
        confidence *= 0.75;
    }

    confidence.clamp(0.0, 1.0)
}

/// Aggregate confidence from multiple independent evidence sources
/// using the noisy-OR model: p = 1 - Π(1 - p_i)
pub fn aggregate_confidence(confidences: &[f64]) -> f64 {
    if confidences.is_empty() {
        return 0.0;
    }
    let product: f64 = confidences
        .iter()
        .map(|&p| 1.0 - p.clamp(0.0, 1.0))
        .product();
    1.0 - product
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdrawn_is_zero() {
        let mods = ConfidenceModifiers { is_withdrawn: true, ..Default::default() };
        assert_eq!(compute_confidence(0.9, &mods), 0.0);
    }

    #[test]
    fn test_document_level_penalty() {
        let mods = ConfidenceModifiers::default();
        let c = compute_confidence(0.60, &mods);
        assert!((c - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_aggregate_noisy_or() {
        // Two independent pieces of evidence at 0.7 each
        // Expected: 1 - (0.3 * 0.3) = 0.91
        let agg = aggregate_confidence(&[0.7, 0.7]);
        assert!((agg - 0.91).abs() < 1e-6);
    }

    #[test]
    fn test_capped_at_one() {
        let mods = ConfidenceModifiers {
            is_late_phase: true,
            same_sentence: true,
            ..Default::default()
        };
        assert!(compute_confidence(0.95, &mods) <= 1.0);
        assert_eq!(aggregate_confidence(&[]), 0.0);
    }
}
