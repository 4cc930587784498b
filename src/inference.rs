//! Metadata inference for newly-seen reading types.

use crate::metadata::{Category, Metadata};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Provider '{0}' unavailable")]
    ProviderUnavailable(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        InferenceError::Http(e.to_string())
    }
}

/// Produces descriptive metadata for a reading type key from one sample value.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, key: &str, sample: &Value) -> Result<Metadata, InferenceError>;
    fn name(&self) -> &str;
}

/// Offline fallback used when no model is configured.
pub struct HeuristicInference;

#[async_trait]
impl InferenceProvider for HeuristicInference {
    async fn infer(&self, key: &str, _sample: &Value) -> Result<Metadata, InferenceError> {
        Ok(Metadata {
            original_key: key.to_string(),
            label: capitalize(key),
            unit: String::new(),
            description: "Auto-detected field".to_string(),
            category: Category::Other,
        })
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

pub struct GeminiInference {
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InferredFields {
    label: String,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: Category,
}

impl GeminiInference {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
        })
    }

    pub fn build_prompt(&self, key: &str, sample: &Value) -> String {
        format!(
            "Act as an IoT data expert. A sensor published a raw JSON field.\n\
             Key: \"{}\"\n\
             Sample value: {}\n\n\
             Infer the most likely human-readable name, unit and description.\n\
             Return ONLY valid JSON in this format:\n\
             {{\"label\": \"Human Readable Name\", \"unit\": \"Unit or empty string\", \
             \"description\": \"Short explanation\", \
             \"category\": \"sensor\" | \"status\" | \"technical\" | \"other\"}}",
            key, sample
        )
    }

    pub fn parse_response(&self, key: &str, json: &Value) -> Result<Metadata, InferenceError> {
        let text = json
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                InferenceError::Parse("Missing candidates[0].content.parts[0].text".to_string())
            })?;

        let cleaned = text.replace("```json", "").replace("```", "");
        let fields: InferredFields = serde_json::from_str(cleaned.trim())
            .map_err(|e| InferenceError::Parse(format!("model output for '{}': {}", key, e)))?;

        Ok(Metadata {
            original_key: key.to_string(),
            label: fields.label,
            unit: fields.unit,
            description: fields.description,
            category: fields.category,
        })
    }
}

#[async_trait]
impl InferenceProvider for GeminiInference {
    async fn infer(&self, key: &str, sample: &Value) -> Result<Metadata, InferenceError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": self.build_prompt(key, sample)}]}]
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::ProviderUnavailable(format!("gemini: {}", e)))?
            .error_for_status()?;

        let json: Value = resp.json().await?;
        self.parse_response(key, &json)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
