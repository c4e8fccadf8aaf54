//! Flags likely identity splits: a key created in the same run another,
//! similar key was deactivated. Nothing is merged; the output is for review.

use lrt_core::ChangeEvent;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitCandidate {
    pub created_key: String,
    pub deactivated_key: String,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReviewConfig {
    pub review_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.9,
        }
    }
}

pub struct IdentityReview {
    config: ReviewConfig,
}

impl IdentityReview {
    pub fn new(config: ReviewConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.review_threshold
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Weighted toward the `name` key part when the key has one.
    pub fn similarity(&self, key_fields: &[String], a: &[String], b: &[String]) -> f64 {
        let name_index = key_fields.iter().position(|f| f == "name");
        let (name_a, rest_a) = split_parts(a, name_index);
        let (name_b, rest_b) = split_parts(b, name_index);
        let name_score = jaro_winkler(
            &Self::normalize_key_fragment(&name_a),
            &Self::normalize_key_fragment(&name_b),
        );
        let rest_score = jaro_winkler(
            &Self::normalize_key_fragment(&rest_a),
            &Self::normalize_key_fragment(&rest_b),
        );
        (name_score * 0.7) + (rest_score * 0.3)
    }

    pub fn candidates(&self, key_fields: &[String], changes: &[ChangeEvent]) -> Vec<SplitCandidate> {
        let created: Vec<_> = changes
            .iter()
            .filter_map(|c| match c {
                ChangeEvent::Created { key } => Some(key),
                _ => None,
            })
            .collect();
        let deactivated: Vec<_> = changes
            .iter()
            .filter_map(|c| match c {
                ChangeEvent::Deactivated { key } => Some(key),
                _ => None,
            })
            .collect();

        let mut out = Vec::new();
        for new_key in &created {
            for old_key in &deactivated {
                let score = self.similarity(key_fields, new_key.parts(), old_key.parts());
                if score >= self.config.review_threshold {
                    out.push(SplitCandidate {
                        created_key: new_key.to_string(),
                        deactivated_key: old_key.to_string(),
                        confidence_score: score,
                    });
                }
            }
        }
        out.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
        out
    }
}

fn split_parts(parts: &[String], name_index: Option<usize>) -> (String, String) {
    match name_index.and_then(|i| parts.get(i).map(|name| (i, name))) {
        Some((i, name)) => {
            let rest = parts
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, p)| p.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            (name.clone(), rest)
        }
        None => (parts.join(" "), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lrt_core::{EntityKind, LifecyclePolicy, RawRecord, ReconcileOptions, Reconciler};

    fn member(group: &str, name: &str, bloc: &str) -> RawRecord {
        RawRecord::from([
            ("group_code".to_string(), group.to_string()),
            ("name".to_string(), name.to_string()),
            ("affiliation".to_string(), bloc.to_string()),
        ])
    }

    fn changes_for(existing: Vec<RawRecord>, snapshot: Vec<RawRecord>) -> (Vec<String>, Vec<ChangeEvent>) {
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let second = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let options = ReconcileOptions::default();
        let seed = Reconciler::new(LifecyclePolicy::resolve(EntityKind::Member, &options, first).unwrap())
            .reconcile(Vec::new(), existing);
        let reconciler =
            Reconciler::new(LifecyclePolicy::resolve(EntityKind::Member, &options, second).unwrap());
        let result = reconciler.reconcile(seed.merged, snapshot);
        (reconciler.policy().key_fields.clone(), result.changes)
    }

    #[test]
    fn affiliation_change_is_flagged_as_possible_split() {
        let (key_fields, changes) = changes_for(
            vec![member("CULT", "Ana Pérez", "Bloque X"), member("CULT", "Beto Gómez", "Bloque Y")],
            vec![member("CULT", "Ana Pérez", "Bloque Z"), member("CULT", "Beto Gómez", "Bloque Y")],
        );
        let candidates = IdentityReview::new(ReviewConfig::default()).candidates(&key_fields, &changes);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].created_key, "CULT | Ana Pérez | Bloque Z");
        assert_eq!(candidates[0].deactivated_key, "CULT | Ana Pérez | Bloque X");
        assert!(candidates[0].confidence_score >= 0.9);
    }

    #[test]
    fn unrelated_turnover_is_not_flagged() {
        let (key_fields, changes) = changes_for(
            vec![member("CULT", "Ana Pérez", "Bloque X")],
            vec![member("CULT", "Rodolfo Suárez", "Bloque X")],
        );
        let candidates = IdentityReview::new(ReviewConfig::default()).candidates(&key_fields, &changes);
        assert!(candidates.is_empty());
    }

    #[test]
    fn normalization_ignores_case_and_punctuation() {
        assert_eq!(IdentityReview::normalize_key_fragment("PÉREZ,  Ana."), "pérez ana");
    }
}
