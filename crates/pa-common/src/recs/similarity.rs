use std::collections::BTreeMap;

use crate::config::WeightedField;

/// Weighted attribute similarity between two visitor profiles.
///
/// Each configured field present (non-blank) in BOTH profiles contributes its
/// weight to the denominator, and to the numerator when the values match
/// (case-insensitive, trimmed). Returns `None` when no configured field is
/// shared; callers must exclude the pair rather than score it as zero.
pub fn attribute_similarity(
    a: &BTreeMap<String, String>,
    b: &BTreeMap<String, String>,
    fields: &[WeightedField],
) -> Option<f64> {
    let mut matched = 0.0;
    let mut total = 0.0;

    for field in fields {
        let va = a.get(&field.name).map(|v| v.trim()).filter(|v| !v.is_empty());
        let vb = b.get(&field.name).map(|v| v.trim()).filter(|v| !v.is_empty());
        let (Some(va), Some(vb)) = (va, vb) else {
            continue;
        };

        total += field.weight;
        if va.eq_ignore_ascii_case(vb) {
            matched += field.weight;
        }
    }

    if total == 0.0 {
        None
    } else {
        Some(matched / total)
    }
}

/// Cosine similarity between two session embeddings, in [-1, 1].
///
/// Returns `None` when either vector is absent, empty, zero-normed, or the
/// dimensions disagree. `None` means "signal unavailable"; treating it as a
/// zero score would bias rankings toward content-poor sessions.
pub fn content_similarity(a: Option<&[f32]>, b: Option<&[f32]>) -> Option<f64> {
    let (a, b) = (a?, b?);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if a.len() != b.len() {
        tracing::warn!(
            a_len = a.len(),
            b_len = b.len(),
            "embedding dimension mismatch; content signal unavailable"
        );
        return None;
    }

    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    Some((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn fields(pairs: &[(&str, f64)]) -> Vec<WeightedField> {
        pairs
            .iter()
            .map(|(name, weight)| WeightedField::new(*name, *weight))
            .collect()
    }

    #[test]
    fn identical_profiles_score_one() {
        let p = profile(&[("job_role", "Vet"), ("practice", "Small Animal")]);
        let f = fields(&[("job_role", 1.0), ("practice", 0.5)]);

        assert_eq!(attribute_similarity(&p, &p, &f), Some(1.0));
    }

    #[test]
    fn single_shared_matching_field_scores_one() {
        let a = profile(&[("job_role", "Nurse")]);
        let b = profile(&[("job_role", "nurse"), ("practice", "Equine")]);
        let f = fields(&[("job_role", 1.0), ("practice", 2.0)]);

        // practice is absent on one side, so only job_role is in the basis.
        assert_eq!(attribute_similarity(&a, &b, &f), Some(1.0));
    }

    #[test]
    fn mismatch_weighs_against_shared_basis() {
        let a = profile(&[("job_role", "Vet"), ("practice", "Equine")]);
        let b = profile(&[("job_role", "Vet"), ("practice", "Small Animal")]);
        let f = fields(&[("job_role", 3.0), ("practice", 1.0)]);

        let score = attribute_similarity(&a, &b, &f).unwrap();
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn no_shared_fields_is_unavailable() {
        let a = profile(&[("job_role", "Vet")]);
        let b = profile(&[("practice", "Equine")]);
        let f = fields(&[("job_role", 1.0), ("practice", 1.0)]);

        assert_eq!(attribute_similarity(&a, &b, &f), None);
    }

    #[test]
    fn blank_values_count_as_absent() {
        let a = profile(&[("job_role", "  ")]);
        let b = profile(&[("job_role", "Vet")]);
        let f = fields(&[("job_role", 1.0)]);

        assert_eq!(attribute_similarity(&a, &b, &f), None);
    }

    #[test]
    fn orthogonal_embeddings_score_zero() {
        let x = vec![1.0, 0.0];
        let y = vec![0.0, 1.0];

        let sim = content_similarity(Some(&x), Some(&y)).unwrap();
        assert!(sim.abs() < 1e-9);
    }

    #[test]
    fn content_similarity_is_symmetric() {
        let a = vec![0.3, 0.7, -0.2];
        let b = vec![0.1, 0.4, 0.9];

        assert_eq!(
            content_similarity(Some(&a), Some(&b)),
            content_similarity(Some(&b), Some(&a))
        );
    }

    #[test]
    fn missing_or_degenerate_vectors_are_unavailable() {
        let a = vec![1.0, 0.0];
        let zero = vec![0.0, 0.0];
        let short = vec![1.0];

        assert_eq!(content_similarity(None, Some(&a)), None);
        assert_eq!(content_similarity(Some(&a), Some(&zero)), None);
        assert_eq!(content_similarity(Some(&a), Some(&short)), None);
        assert_eq!(content_similarity(Some(&a), Some(&[])), None);
    }

    #[test]
    fn opposite_embeddings_score_negative_one() {
        let a = vec![0.5, -0.5];
        let b = vec![-0.5, 0.5];

        let sim = content_similarity(Some(&a), Some(&b)).unwrap();
        assert!((sim + 1.0).abs() < 1e-9);
    }
}
