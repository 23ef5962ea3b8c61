use crate::config::{LlmConfig, LlmMode};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<LlmResponse>;
    fn provider_name(&self) -> &'static str;
}

pub mod echo;
pub mod openai;

pub fn client_from_config(cfg: &LlmConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    match cfg.mode {
        LlmMode::Echo => Ok(Arc::new(echo::EchoClient::new(cfg.response.clone()))),
        LlmMode::Openai => {
            let api_key = std::env::var(&cfg.api_key_env).map_err(|_| {
                anyhow::anyhow!("environment variable {} is not set", cfg.api_key_env)
            })?;
            Ok(Arc::new(openai::OpenAiClient::new(
                cfg.model.clone(),
                cfg.base_url.clone(),
                api_key,
                cfg.temperature,
                cfg.max_retries,
            )))
        }
    }
}
