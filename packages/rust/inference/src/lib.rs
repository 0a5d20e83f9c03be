//! Inference backend: prompt in, text out.
//!
//! [`InferenceBackend`] is the seam the engine uses for `ai_analysis`
//! processors and actions. [`OpenRouterBackend`] talks to any
//! OpenAI-compatible chat completions endpoint.

mod openrouter;

use async_trait::async_trait;

use siteflow_shared::Result;

pub use openrouter::OpenRouterBackend;

/// A single completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Overrides the backend's configured temperature.
    pub temperature: Option<f32>,
    /// Overrides the backend's configured token limit.
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// External text-generation capability.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}
