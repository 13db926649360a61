//! Structured AI repair: ask a model for one replacement selector, trust it
//! only after it resolves on the live page, then persist it.
//!
//! Every failure in here degrades to "no suggestion"; nothing is raised to
//! the pipeline.
pub mod sanitize;

use crate::repository::SelectorStore;
use driftguard_common::RepairSettings;
use driftguard_drivers::{BrowserPage, ElementHandle, ElementState};
use driftguard_llm::traits::{LlmClient, OutputSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub use sanitize::{sanitize_html, REDACTED};

const SYSTEM_PROMPT: &str = "You repair broken CSS selectors for browser automation. \
You receive a sanitized HTML document, the selector that no longer matches, and a description \
of the element it used to find. Answer with one CSS selector that uniquely matches that element \
in the given HTML. Prefer stable attributes (id, name, type, aria-*, role) over generated class \
names and positional selectors. If the element is not present, set found to false.";

/// Output contract of the repair model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepairResult {
    pub found: bool,
    pub selector: String,
    pub confidence: f64,
    pub rationale: String,
}

impl RepairResult {
    pub fn output_schema() -> OutputSchema {
        OutputSchema::new(
            "selector_repair",
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["found", "selector", "confidence", "rationale"],
                "properties": {
                    "found": { "type": "boolean" },
                    "selector": { "type": "string" },
                    "confidence": { "type": "number" },
                    "rationale": { "type": "string" }
                }
            }),
        )
    }

    /// Deserialize and check the value ranges the schema cannot express.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let result: Self = serde_json::from_value(value).map_err(|e| e.to_string())?;
        if !(0.0..=1.0).contains(&result.confidence) {
            return Err(format!("confidence {} outside [0, 1]", result.confidence));
        }
        if result.found && result.selector.trim().is_empty() {
            return Err("found is true but selector is empty".to_string());
        }
        Ok(result)
    }

    pub fn passes(&self, threshold: f64) -> bool {
        self.found && self.confidence >= threshold
    }
}

/// One repair attempt for a path whose candidates were all exhausted.
#[derive(Debug, Clone)]
pub struct RepairRequest<'a> {
    pub path: &'a str,
    pub broken_selector: &'a str,
    pub description: &'a str,
    pub state: ElementState,
    /// Time left for the whole attempt: page snapshot, model call and
    /// live validation.
    pub timeout: Duration,
}

pub struct RepairedElement {
    pub handle: ElementHandle,
    pub selector: String,
    pub confidence: f64,
}

#[derive(Debug, Default)]
struct RepairStats {
    requests: AtomicU64,
    accepted: AtomicU64,
    below_threshold: AtomicU64,
    invalid_responses: AtomicU64,
    transport_errors: AtomicU64,
    validated: AtomicU64,
    validation_failed: AtomicU64,
    persisted: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairStatus {
    pub available: bool,
    pub model: Option<String>,
    pub requests: u64,
    pub accepted: u64,
    pub below_threshold: u64,
    pub invalid_responses: u64,
    pub transport_errors: u64,
    pub validated: u64,
    pub validation_failed: u64,
    pub persisted: u64,
}

pub struct SelectorRepairer {
    llm: Option<Arc<dyn LlmClient>>,
    settings: RepairSettings,
    stats: RepairStats,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SelectorRepairer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, settings: RepairSettings) -> Self {
        Self {
            llm,
            settings,
            stats: RepairStats::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.settings.enabled && self.llm.is_some()
    }

    /// Ask the model for a replacement selector. Returns `None` unless the
    /// answer is well formed, `found`, and at or above the confidence threshold.
    pub async fn suggest(
        &self,
        html: &str,
        broken_selector: &str,
        description: &str,
    ) -> Option<RepairResult> {
        let llm = match &self.llm {
            Some(llm) if self.settings.enabled => llm,
            _ => {
                tracing::debug!("repair.skipped.unavailable");
                return None;
            }
        };
        bump(&self.stats.requests);

        let cleaned = match sanitize_html(html, self.settings.max_html_chars) {
            Ok(cleaned) => cleaned,
            Err(e) => {
                tracing::warn!(error = %e, "repair.sanitize.failed");
                return None;
            }
        };
        let prompt = json!({
            "broken_selector": broken_selector,
            "element_description": description,
            "html": cleaned,
        })
        .to_string();
        tracing::debug!(
            model = llm.model_name(),
            %broken_selector,
            html_chars = cleaned.len(),
            "repair.request"
        );

        let value = match llm
            .generate_structured(&prompt, Some(SYSTEM_PROMPT), &RepairResult::output_schema())
            .await
        {
            Ok(value) => value,
            Err(e) => {
                bump(&self.stats.transport_errors);
                tracing::warn!(error = %e, "repair.request.failed");
                return None;
            }
        };

        let result = match RepairResult::from_value(value) {
            Ok(result) => result,
            Err(e) => {
                bump(&self.stats.invalid_responses);
                tracing::warn!(error = %e, "repair.response.invalid");
                return None;
            }
        };

        if !result.passes(self.settings.confidence_threshold) {
            bump(&self.stats.below_threshold);
            tracing::info!(
                found = result.found,
                confidence = result.confidence,
                threshold = self.settings.confidence_threshold,
                "repair.suggestion.rejected"
            );
            return None;
        }

        bump(&self.stats.accepted);
        tracing::info!(
            selector = %result.selector,
            confidence = result.confidence,
            "repair.suggestion.accepted"
        );
        Some(result)
    }

    /// Suggest, validate against the live page, and persist on success.
    pub async fn repair(
        &self,
        page: &dyn BrowserPage,
        store: &dyn SelectorStore,
        request: &RepairRequest<'_>,
    ) -> Option<RepairedElement> {
        if !self.is_available() {
            tracing::debug!(path = %request.path, "repair.skipped.unavailable");
            return None;
        }

        let deadline = crate::pipeline::deadline_after(request.timeout);
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let html = match tokio::time::timeout(remaining(), page.content()).await {
            Ok(Ok(html)) => html,
            Ok(Err(e)) => {
                tracing::warn!(path = %request.path, error = %e, "repair.page_content.failed");
                return None;
            }
            Err(_) => {
                bump(&self.stats.transport_errors);
                tracing::warn!(path = %request.path, "repair.page_content.timed_out");
                return None;
            }
        };

        let suggestion = match tokio::time::timeout(
            remaining(),
            self.suggest(&html, request.broken_selector, request.description),
        )
        .await
        {
            Ok(suggestion) => suggestion?,
            Err(_) => {
                bump(&self.stats.transport_errors);
                tracing::warn!(
                    path = %request.path,
                    budget_ms = request.timeout.as_millis() as u64,
                    "repair.request.timed_out"
                );
                return None;
            }
        };

        let timeout = remaining().min(self.settings.validation_timeout());
        if timeout.is_zero() {
            bump(&self.stats.validation_failed);
            tracing::info!(
                path = %request.path,
                selector = %suggestion.selector,
                "repair.validation.no_time_left"
            );
            return None;
        }
        let handle = match page
            .wait_for_css(&suggestion.selector, request.state, timeout)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                bump(&self.stats.validation_failed);
                tracing::info!(
                    path = %request.path,
                    selector = %suggestion.selector,
                    error = %e,
                    "repair.validation.failed"
                );
                return None;
            }
        };
        bump(&self.stats.validated);

        match store.update(request.path, &suggestion.selector).await {
            Ok(_) => {
                bump(&self.stats.persisted);
                tracing::info!(
                    path = %request.path,
                    selector = %suggestion.selector,
                    "repair.persisted"
                );
            }
            Err(e) => {
                tracing::warn!(path = %request.path, error = %e, "repair.persist.failed");
            }
        }

        Some(RepairedElement {
            handle,
            selector: suggestion.selector,
            confidence: suggestion.confidence,
        })
    }

    pub fn status(&self) -> RepairStatus {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RepairStatus {
            available: self.is_available(),
            model: self.llm.as_ref().map(|l| l.model_name().to_string()),
            requests: load(&self.stats.requests),
            accepted: load(&self.stats.accepted),
            below_threshold: load(&self.stats.below_threshold),
            invalid_responses: load(&self.stats.invalid_responses),
            transport_errors: load(&self.stats.transport_errors),
            validated: load(&self.stats.validated),
            validation_failed: load(&self.stats.validation_failed),
            persisted: load(&self.stats.persisted),
        }
    }
}
