use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;

/// Label whose presence in the top ranks marks text as a medical report
pub const MEDICAL_LABEL: &str = "medical report";

/// How many top-ranked labels are inspected for [`MEDICAL_LABEL`]
pub const TOP_K: usize = 3;

/// Candidate labels offered to the zero-shot classifier, in order
pub const CANDIDATE_LABELS: [&str; 10] = [
    MEDICAL_LABEL,
    "technical documentation",
    "news article",
    "personal message",
    "social media post",
    "casual conversation",
    "legal text",
    "educational content",
    "code or programming request",
    "AI prompt engineering",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// Label to score mapping ranked by descending score.
///
/// Ties keep the order in which the classifier reported the labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    ranked: Vec<LabelScore>,
}

impl ClassificationResult {
    pub fn new(scores: impl IntoIterator<Item = (String, f64)>) -> Self {
        let mut ranked: Vec<LabelScore> = scores
            .into_iter()
            .map(|(label, score)| LabelScore { label, score })
            .collect();
        // stable sort, so equal scores stay in insertion order
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self { ranked }
    }

    pub fn ranked(&self) -> &[LabelScore] {
        &self.ranked
    }

    pub fn top(&self, k: usize) -> &[LabelScore] {
        &self.ranked[..k.min(self.ranked.len())]
    }

    pub fn score(&self, label: &str) -> Option<f64> {
        self.ranked
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.score)
    }

    pub fn is_medical(&self) -> bool {
        self.top(TOP_K).iter().any(|entry| entry.label == MEDICAL_LABEL)
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

/// External zero-shot text classification capability
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, labels: &[&str]) -> Result<ClassificationResult>;
}

/// Guards the simplification pipeline against non-medical input
#[derive(Clone)]
pub struct MedicalGuard {
    classifier: Arc<dyn Classifier>,
}

impl MedicalGuard {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    /// Classify `text` over [`CANDIDATE_LABELS`]. Failures propagate, there is no retry.
    pub async fn classify(&self, text: &str) -> Result<ClassificationResult> {
        let result = self.classifier.classify(text, &CANDIDATE_LABELS).await?;
        debug!(top = ?result.top(TOP_K), "classification completed");
        Ok(result)
    }

    pub async fn is_medical(&self, text: &str) -> Result<bool> {
        let medical = self.classify(text).await?.is_medical();
        info!(medical, "medical report check");
        Ok(medical)
    }
}

/// Fragments describing a classification: header, top-3 `label: score` lines and a verdict
pub fn preview_fragments(result: &ClassificationResult) -> Vec<String> {
    let mut fragments = vec![
        "Running classification task...\n".to_string(),
        "\nTop Predictions:\n".to_string(),
    ];
    for entry in result.top(TOP_K) {
        fragments.push(format!("- {}: {:.2}%\n", entry.label, entry.score * 100.0));
    }
    let verdict = if result.is_medical() {
        "\nThis looks like a medical report.\n"
    } else {
        "\nThis input does not appear to be a medical report.\n"
    };
    fragments.push(verdict.to_string());
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedClassifier;

    fn result(pairs: &[(&str, f64)]) -> ClassificationResult {
        ClassificationResult::new(pairs.iter().map(|(l, s)| (l.to_string(), *s)))
    }

    #[test]
    fn ranks_by_descending_score_keeping_ties_in_order() {
        let r = result(&[("a", 0.1), ("b", 0.5), ("c", 0.5), ("d", 0.9)]);
        let labels: Vec<&str> = r.ranked().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn medical_only_when_in_top_three() {
        let third = result(&[
            ("news article", 0.4),
            ("legal text", 0.3),
            (MEDICAL_LABEL, 0.2),
            ("personal message", 0.1),
        ]);
        assert!(third.is_medical());

        let fourth = result(&[
            ("news article", 0.4),
            ("legal text", 0.3),
            ("personal message", 0.2),
            (MEDICAL_LABEL, 0.1),
        ]);
        assert!(!fourth.is_medical());
        assert_eq!(fourth.score(MEDICAL_LABEL), Some(0.1));
    }

    #[test]
    fn top_is_clamped_to_available_labels() {
        let r = result(&[(MEDICAL_LABEL, 1.0)]);
        assert_eq!(r.top(3).len(), 1);
        assert!(ClassificationResult::default().top(3).is_empty());
    }

    #[test]
    fn preview_lists_top_three_and_verdict() {
        let r = result(&[
            (MEDICAL_LABEL, 0.8123),
            ("news article", 0.1),
            ("legal text", 0.05),
            ("personal message", 0.01),
        ]);
        let fragments = preview_fragments(&r);
        assert_eq!(fragments.len(), 6);
        assert_eq!(fragments[2], "- medical report: 81.23%\n");
        assert_eq!(fragments[5], "\nThis looks like a medical report.\n");
    }

    #[tokio::test]
    async fn guard_uses_fixed_label_set() {
        let classifier = Arc::new(FixedClassifier::medical());
        let guard = MedicalGuard::new(classifier.clone());

        assert!(guard.is_medical("Patient denies chest pain").await.unwrap());
        let seen = classifier.seen_labels();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], CANDIDATE_LABELS.map(str::to_string).to_vec());
    }
}
