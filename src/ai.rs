use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use crate::config::AiConfig;

/// Instruction sent alongside the SQL script.
pub const DEFAULT_PROMPT: &str = "Explain what this SQL query does in simple terms.";

const MISSING_KEY_MESSAGE: &str = "AI Explanation not available: no API key configured. \
    Set ai.api_key in the config file or export GEMINI_API_KEY.";

/// Client for the generative-language explanation API.
///
/// The credential is an explicit `Option` passed in at construction; a
/// client without one still works and answers every request with a fixed
/// degraded message. All other failures (network, quota, malformed
/// responses) likewise degrade to readable text instead of an error.
pub struct ExplanationClient {
    api_key: Option<String>,
    endpoint: String,
    primary_model: String,
    fallback_model: String,
    http: reqwest::Client,
}

impl ExplanationClient {
    pub fn new(api_key: Option<String>, cfg: &AiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            api_key,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            primary_model: cfg.primary_model.clone(),
            fallback_model: cfg.fallback_model.clone(),
            http,
        })
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a natural-language explanation for a SQL script.
    ///
    /// Tries the primary model first, then the fallback model. Never
    /// returns an error; the caller always gets displayable text.
    pub async fn explain(&self, sql: &str, prompt: &str) -> String {
        let Some(key) = self.api_key.as_deref() else {
            return MISSING_KEY_MESSAGE.to_string();
        };
        match self.generate(key, &self.primary_model, sql, prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    "explanation request failed with model {}: {}",
                    self.primary_model,
                    e
                );
                match self.generate(key, &self.fallback_model, sql, prompt).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(
                            "explanation request failed with fallback model {}: {}",
                            self.fallback_model,
                            e
                        );
                        format!("Error: Unable to generate explanation. Error: {e}")
                    }
                }
            }
        }
    }

    async fn generate(&self, key: &str, model: &str, sql: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, model);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": format!("{prompt}\n\nSQL:\n{sql}") }] }]
        });
        let response = self
            .http
            .post(&url)
            .query(&[("key", key)])
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let value: serde_json::Value = response.json().await?;
        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("response contained no generated text"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn test_explain_without_credential_returns_degraded_message() {
        let client = ExplanationClient::new(None, &AiConfig::default()).unwrap();
        assert!(!client.has_credential());
        let text = client.explain("SELECT 1", DEFAULT_PROMPT).await;
        assert_eq!(text, MISSING_KEY_MESSAGE);
    }
}
