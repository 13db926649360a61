use async_trait::async_trait;
use driftguard_common::{DriftError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: Option<String>,
    pub tokens_used: Option<u32>,
}

/// JSON schema the model output must conform to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Short identifier, sent to providers that require a schema name.
    pub name: String,
    pub schema: Value,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a free-text response to the given prompt.
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<LlmResponse>;

    /// Ask for exactly one JSON value shaped by `schema`.
    ///
    /// Providers with native structured output override this. The default
    /// embeds the schema in the system prompt and pulls the first JSON object
    /// out of the reply. Callers must still validate the returned value.
    async fn generate_structured(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        schema: &OutputSchema,
    ) -> Result<Value> {
        let system = format!(
            "{}\n\nReturn STRICT JSON ONLY, one object matching this JSON schema:\n{}",
            system_prompt.unwrap_or_default(),
            schema.schema
        );
        let response = self
            .generate(prompt, Some(&system), Some(512), Some(0.0))
            .await?;
        parse_json_object(&response.text)
    }

    /// Check if the LLM service is available.
    async fn health_check(&self) -> Result<bool>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Try to extract a ```json ... ``` fenced block; fall back to the outermost braces.
pub fn extract_json_block(text: &str) -> Option<String> {
    let re_fence = Regex::new("(?s)```(?:json)?\\s*(\\{.*?\\})\\s*```").ok()?;
    if let Some(caps) = re_fence.captures(text) {
        return Some(caps.get(1)?.as_str().to_string());
    }
    let re_plain = Regex::new("(?s)(\\{.*\\})").ok()?;
    re_plain
        .captures(text)
        .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
}

/// Parse model output into a JSON object, tolerating fences and surrounding prose.
pub fn parse_json_object(text: &str) -> Result<Value> {
    let block = extract_json_block(text).ok_or_else(|| {
        DriftError::ExternalRepairUnavailable("no JSON object in model output".to_string())
    })?;
    let value: Value = serde_json::from_str(&block).map_err(|e| {
        DriftError::ExternalRepairUnavailable(format!("model output is not valid JSON: {e}"))
    })?;
    if !value.is_object() {
        return Err(DriftError::ExternalRepairUnavailable(
            "model output is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}
