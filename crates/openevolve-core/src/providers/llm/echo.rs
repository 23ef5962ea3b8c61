use super::{LlmClient, LlmResponse};
use async_trait::async_trait;

/// Returns a fixed body for every prompt. Used by tests and offline runs; a
/// fixed-diff echo must work end-to-end.
pub struct EchoClient {
    response: String,
}

impl EchoClient {
    pub fn new(response: String) -> Self {
        Self { response }
    }
}

#[async_trait]
impl LlmClient for EchoClient {
    async fn complete(&self, _prompt: &str) -> anyhow::Result<LlmResponse> {
        Ok(LlmResponse {
            text: self.response.clone(),
            provider: "echo".to_string(),
            model: "echo".to_string(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "echo"
    }
}
