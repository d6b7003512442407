use crate::config::LlmSettings;
use crate::error::{FusionError, Result};
use tracing::{debug, warn};

/// OpenAI-compatible chat-completion client.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
        }
    }

    /// Build a client from settings; `None` when no API key is configured.
    pub fn from_settings(settings: &LlmSettings) -> Option<Self> {
        let api_key = settings.api_key.as_ref().filter(|k| !k.trim().is_empty())?;
        Some(Self::new(
            api_key.clone(),
            settings.model.clone(),
            settings.base_url.trim_end_matches('/').to_string(),
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn call_llm(&self, prompt: &str) -> Result<String> {
        let client = reqwest::Client::new();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "Return JSON only, no text."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
        });

        // Reasoning models spend completion tokens on hidden reasoning
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(400);
        } else {
            body["max_tokens"] = serde_json::json!(400);
        }

        debug!("Calling LLM model {} at {}", self.model, self.base_url);

        let response = client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| FusionError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(FusionError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FusionError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(FusionError::Llm(format!("LLM API error: {}", error)));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| FusionError::Llm("No choices array in LLM response".to_string()))?;

        let first = choices
            .first()
            .ok_or_else(|| FusionError::Llm("Empty choices array in LLM response".to_string()))?;

        match first.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(FusionError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ))
            }
            _ => {}
        }

        let content = first["message"]["content"]
            .as_str()
            .ok_or_else(|| FusionError::Llm("No content in LLM response".to_string()))?;

        if content.trim().is_empty() {
            return Err(FusionError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}

/// Pull the JSON payload out of a model response that may be wrapped in
/// Markdown fences or surrounded by prose.
pub fn extract_json_from_response(response: &str) -> String {
    if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim().to_string();
        }
    }
    if let Some(start) = response.find("```") {
        let after_start = &response[start + 3..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim().to_string();
        }
    }

    let json_start = response.find('{');
    let json_end = response.rfind('}');
    match (json_start, json_end) {
        (Some(start), Some(end)) if start < end => response[start..=end].to_string(),
        _ => response.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_response() {
        let response = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_from_response(response), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_from_prose() {
        let response = "Decision: {\"merge_keys\": [\"campaign_id\"]} done";
        assert_eq!(
            extract_json_from_response(response),
            "{\"merge_keys\": [\"campaign_id\"]}"
        );
    }

    #[test]
    fn test_from_settings_requires_key() {
        let mut settings = LlmSettings::default();
        settings.api_key = None;
        assert!(LlmClient::from_settings(&settings).is_none());

        settings.api_key = Some("sk-test".to_string());
        settings.base_url = "https://example.invalid/v1/".to_string();
        let client = LlmClient::from_settings(&settings).unwrap();
        assert_eq!(client.base_url, "https://example.invalid/v1");
    }
}
