//! Provider‑agnostic LLM integration for driftguard.
//!
//! This crate exposes a common [`traits::LlmClient`] interface with
//! schema‑constrained generation and concrete providers for OpenAI and
//! Ollama. [`ensure_llm_ready`] builds a client from a
//! [`driftguard_common::LlmConfig`].
//!
//! # Examples
//! ```no_run
//! use driftguard_common::{LlmConfig, Result};
//! use driftguard_llm::ensure_llm_ready;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let cfg = LlmConfig::Ollama {
//!     model: "llama3.2:3b".into(),
//!     endpoint: "http://localhost:11434".into(),
//!     temperature: None,
//! };
//! let client = ensure_llm_ready(&cfg).await?;
//! assert!(!client.model_name().is_empty());
//! # Ok(())
//! # }
//! ```
pub mod ollama;
pub mod openai;
pub mod traits;

use driftguard_common::{DriftError, LlmConfig};
use ollama::OllamaClient;
use openai::OpenAiClient;
use std::sync::Arc;
use traits::LlmClient;

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2:3b";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Build a ready-to-use client for the configured provider.
///
/// `LlmConfig::None` yields `ExternalRepairUnavailable`; callers treat that as
/// "repair disabled".
pub async fn ensure_llm_ready(
    config: &LlmConfig,
) -> driftguard_common::Result<Arc<dyn LlmClient + Send + Sync + 'static>> {
    match config {
        LlmConfig::Ollama {
            endpoint,
            model,
            temperature,
        } => {
            let client = OllamaClient::new(endpoint.clone(), model.clone())
                .await?
                .with_temperature(*temperature);
            Ok(Arc::new(client))
        }
        LlmConfig::Openai {
            endpoint,
            api_key,
            model,
            temperature,
        } => {
            if api_key.trim().is_empty() || api_key.contains("${") {
                return Err(DriftError::ExternalRepairUnavailable(
                    "OpenAI api_key is not set".to_string(),
                ));
            }
            let client = OpenAiClient::new(endpoint, api_key.clone(), model.clone())?
                .with_temperature(*temperature);
            Ok(Arc::new(client))
        }
        LlmConfig::None => Err(DriftError::ExternalRepairUnavailable(
            "No LLM configured".to_string(),
        )),
    }
}
