//! Error taxonomy for the evolution loop.
//!
//! Slot-level errors (patch, LLM, evaluator) are converted to rejected
//! candidate records by the engine; `Store` and `PatchRevert` abort the run.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    #[error("config error: {0}")]
    Config(String),

    #[error("patch parse error: {0}")]
    PatchParse(String),

    #[error("patch apply error: {0}")]
    PatchApply(String),

    /// Restoring the pre-patch snapshot failed. The working tree is in an
    /// unknown state, so the run must stop.
    #[error("patch revert failed: {0}")]
    PatchRevert(String),

    #[error("evaluator error: {0}")]
    Evaluator(String),

    #[error("evaluator timed out after {0}s")]
    EvaluatorTimeout(u64),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("llm call timed out after {0}s")]
    LlmTimeout(u64),

    #[error("store error: {0}")]
    Store(String),

    #[error("prompt too large: current code needs {needed} tokens, budget is {budget}")]
    PromptTooLarge { needed: usize, budget: usize },
}

impl EvolveError {
    /// Fatal errors abort the generation instead of producing a rejected
    /// candidate record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvolveError::Store(_) | EvolveError::PatchRevert(_))
    }

    /// Short tag persisted with rejected candidates and event records.
    pub fn tag(&self) -> &'static str {
        match self {
            EvolveError::Config(_) => "config",
            EvolveError::PatchParse(_) => "patch_parse",
            EvolveError::PatchApply(_) => "patch_apply",
            EvolveError::PatchRevert(_) => "patch_revert",
            EvolveError::Evaluator(_) => "evaluator",
            EvolveError::EvaluatorTimeout(_) => "evaluator_timeout",
            EvolveError::Llm(_) => "llm_error",
            EvolveError::LlmTimeout(_) => "llm_timeout",
            EvolveError::Store(_) => "store",
            EvolveError::PromptTooLarge { .. } => "prompt_too_large",
        }
    }
}

impl From<rusqlite::Error> for EvolveError {
    fn from(e: rusqlite::Error) -> Self {
        EvolveError::Store(e.to_string())
    }
}

impl From<ConfigError> for EvolveError {
    fn from(e: ConfigError) -> Self {
        EvolveError::Config(e.0)
    }
}

/// Config loading failure with a human-readable message.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}
