use super::{LlmClient, LlmResponse};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

const SYSTEM_PROMPT: &str =
    "You are an expert software engineer evolving code through structured diffs.";

/// Client for OpenAI-compatible chat completion endpoints.
pub struct OpenAiClient {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        model: String,
        base_url: String,
        api_key: String,
        temperature: f32,
        max_retries: u32,
    ) -> Self {
        Self {
            model,
            base_url,
            api_key,
            temperature,
            max_retries: max_retries.max(1),
            client: reqwest::Client::new(),
        }
    }

    async fn post_chat(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": self.temperature,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat API error ({}): {}", status, error_text);
        }

        let payload: serde_json::Value = resp.json().await?;
        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("chat API response missing content"))?
            .to_string();
        Ok(text)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, prompt: &str) -> anyhow::Result<LlmResponse> {
        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            match self.post_chat(prompt).await {
                Ok(text) => {
                    return Ok(LlmResponse {
                        text,
                        provider: "openai".to_string(),
                        model: self.model.clone(),
                    })
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        let backoff = Duration::from_secs(2u64.pow(attempt).min(10));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("llm call failed")))
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
