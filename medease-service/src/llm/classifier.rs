use async_trait::async_trait;
use medease_flow::{ClassificationResult, Classifier, FlowError, Result};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::config::Config;

/// Zero-shot classification through the Hugging Face inference API
pub struct HuggingFaceClassifier {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

/// The inference API has answered both as one object of parallel lists and as a list of
/// label/score pairs
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ZeroShotResponse {
    Parallel { labels: Vec<String>, scores: Vec<f64> },
    Pairs(Vec<LabelScorePair>),
}

#[derive(Debug, Deserialize)]
struct LabelScorePair {
    label: String,
    score: f64,
}

impl ZeroShotResponse {
    fn into_result(self) -> ClassificationResult {
        match self {
            ZeroShotResponse::Parallel { labels, scores } => {
                ClassificationResult::new(labels.into_iter().zip(scores))
            }
            ZeroShotResponse::Pairs(pairs) => {
                ClassificationResult::new(pairs.into_iter().map(|p| (p.label, p.score)))
            }
        }
    }
}

impl HuggingFaceClassifier {
    pub fn new(url: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            token,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.classifier_url, config.hf_api_token.clone())
    }

    async fn request(&self, text: &str, labels: &[&str]) -> anyhow::Result<ClassificationResult> {
        let mut request = self.http.post(&self.url).json(&json!({
            "inputs": text,
            "parameters": {"candidate_labels": labels},
        }));
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            anyhow::bail!("classifier returned {}: {}", status, details);
        }
        let parsed: ZeroShotResponse = response.json().await?;
        Ok(parsed.into_result())
    }
}

#[async_trait]
impl Classifier for HuggingFaceClassifier {
    async fn classify(&self, text: &str, labels: &[&str]) -> Result<ClassificationResult> {
        debug!(labels = labels.len(), "Requesting zero-shot classification");
        self.request(text, labels).await.map_err(|e| {
            error!("Classification failed: {}", e);
            FlowError::ClassificationFailed(e.to_string())
        })
    }
}
