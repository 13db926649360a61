use crate::traits::{parse_json_object, LlmClient, LlmResponse, OutputSchema};
use async_trait::async_trait;
use driftguard_common::{DriftError, Result};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

const OLLAMA_CONNECTION_ERROR: &str = "No running Ollama server detected. Start it with: `ollama serve` (after installing). Install instructions: https://github.com/ollama/ollama";

/// Ollama client for local model inference.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

impl OllamaClient {
    /// Create a new client and verify server/model availability.
    pub async fn new(base_url: String, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| unavailable(format!("Failed to create HTTP client: {e}")))?;

        let ollama_client = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature: None,
        };

        ollama_client.probe_server().await?;
        ollama_client.ensure_model_available().await?;

        Ok(ollama_client)
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    async fn probe_server(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|_| unavailable(OLLAMA_CONNECTION_ERROR.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(unavailable(OLLAMA_CONNECTION_ERROR.to_string()))
        }
    }

    async fn ensure_model_available(&self) -> Result<()> {
        let models = self.fetch_available_models().await?;

        if !models.iter().any(|m| m == &self.model) {
            tracing::info!(model = %self.model, "llm.ollama.pulling_model");
            self.pull_model(&self.model).await?;
        }

        Ok(())
    }

    async fn fetch_available_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(format!("Failed to fetch models: {e}")))?;

        if !resp.status().is_success() {
            return Ok(Vec::new());
        }

        let val: JsonValue = resp
            .json()
            .await
            .map_err(|e| unavailable(format!("Failed to parse models response: {e}")))?;

        Ok(val
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.get("name").and_then(|n| n.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pull_model(&self, model: &str) -> Result<()> {
        let url = format!("{}/api/pull", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": model, "stream": false }))
            .send()
            .await
            .map_err(|e| unavailable(format!("Failed to pull model: {e}")))?;

        if resp.status().is_success() {
            tracing::info!(model = %model, "llm.ollama.model_pulled");
            Ok(())
        } else {
            Err(unavailable(format!(
                "Failed to pull model: HTTP {}",
                resp.status()
            )))
        }
    }

    async fn post_generate(&self, payload: JsonValue) -> Result<LlmResponse> {
        let url = format!("{}/api/generate", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| unavailable(format!("Generate request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(unavailable(format!(
                "Generate failed: HTTP {}",
                resp.status()
            )));
        }

        let val: JsonValue = resp
            .json()
            .await
            .map_err(|e| unavailable(format!("Failed to parse response: {e}")))?;

        Ok(LlmResponse {
            text: val
                .get("response")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string(),
            model: Some(self.model.clone()),
            tokens_used: val
                .get("eval_count")
                .and_then(|c| c.as_u64())
                .map(|c| c as u32),
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<LlmResponse> {
        let mut options = serde_json::Map::new();
        if let Some(temp) = temperature.or(self.temperature) {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(max_tok) = max_tokens {
            options.insert("num_predict".to_string(), json!(max_tok));
        }

        let mut payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": options,
        });
        if let Some(system) = system_prompt {
            payload["system"] = json!(system);
        }
        self.post_generate(payload).await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        schema: &OutputSchema,
    ) -> Result<JsonValue> {
        let mut payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "format": schema.schema,
            "options": { "temperature": self.temperature.unwrap_or(0.0) },
        });
        if let Some(system) = system_prompt {
            payload["system"] = json!(system);
        }
        let response = self.post_generate(payload).await?;
        parse_json_object(&response.text)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.probe_server().await.is_ok())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn unavailable(msg: String) -> DriftError {
    DriftError::ExternalRepairUnavailable(msg)
}
