#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use driftguard_common::observability::{LogConfig, LogFormat};
use driftguard_common::{DriftError, EngineSettings};
use driftguard_drivers::{
    BrowserPage, CookieInfo, ElementHandle, ElementState, PageElement, SemanticQuery,
    StorageKind, Viewport,
};
use driftguard_llm::traits::{LlmClient, LlmResponse, OutputSchema};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static INIT_PATH: OnceLock<std::path::PathBuf> = OnceLock::new();

pub fn init_test_tracing() {
    let _ = INIT_PATH.get_or_init(|| {
        let config = LogConfig {
            app_name: "driftguard-engine-tests".to_string(),
            log_dir: Some(std::env::temp_dir().join("driftguard-tests")),
            emit_stderr: true,
            format: LogFormat::Text,
            default_filter: "debug".to_string(),
        };
        driftguard_common::observability::init_logging(config).unwrap_or_default()
    });
}

pub const LOGIN_SELECTORS: &str = r##"
default:
  login:
    email:
      primary: "#email"
      fallbacks: ["input[type=email]", "input[name=email]"]
    password:
      primary: "#password"
      fallbacks: ["input[type=password]"]
      semantic: { role: textbox, label: "Password" }
    submit: { primary: "button[type=submit]", fallbacks: ["form button"] }
  search.country: { primary: "select#country", fallbacks: [] }
es:
  login.submit: { primary: "#entrar", fallbacks: ["button.entrar"] }
"##;

/// Settings with millisecond timings, rooted in `dir`.
pub fn fast_settings(dir: &Path) -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.selectors.path = dir.join("selectors.yaml");
    settings.forensics.root_dir = dir.join("incidents");
    settings.hot_reload.poll_interval_ms = 20;
    settings.resolution.semantic_timeout_ms = 10;
    settings.resolution.attempt_timeout_ms = 10;
    settings.resolution.min_attempt_timeout_ms = 5;
    settings.resolution.backoff_base_ms = 1;
    settings.resolution.total_budget_ms = 2_000;
    settings
}

pub fn write_selectors(dir: &Path, yaml: &str) {
    std::fs::write(dir.join("selectors.yaml"), yaml).unwrap();
}

/// In-memory page: a fixed set of CSS selectors is present, everything else misses.
pub struct FakePage {
    present: Mutex<HashSet<String>>,
    semantic_hits: Mutex<Vec<SemanticQuery>>,
    attempts: Mutex<Vec<String>>,
    semantic_attempts: AtomicUsize,
    actions: Arc<Mutex<Vec<String>>>,
    html: String,
    screenshot_fails: bool,
    url_hangs: bool,
}

impl FakePage {
    pub fn new(present: &[&str]) -> Self {
        Self {
            present: Mutex::new(present.iter().map(|s| s.to_string()).collect()),
            semantic_hits: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            semantic_attempts: AtomicUsize::new(0),
            actions: Arc::new(Mutex::new(Vec::new())),
            html: "<html><body><form><input id=\"mail\" name=\"mail\" value=\"bob@example.com\"></form></body></html>".to_string(),
            screenshot_fails: false,
            url_hangs: false,
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn with_semantic_match(self, query: SemanticQuery) -> Self {
        self.semantic_hits.lock().push(query);
        self
    }

    pub fn with_failing_screenshot(mut self) -> Self {
        self.screenshot_fails = true;
        self
    }

    /// `url()` never returns, so a capture stalls after the screenshot and DOM.
    pub fn with_hanging_url(mut self) -> Self {
        self.url_hangs = true;
        self
    }

    pub fn make_present(&self, selector: &str) {
        self.present.lock().insert(selector.to_string());
    }

    /// CSS selectors waited on, in call order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn attempts_for(&self, selector: &str) -> usize {
        self.attempts.lock().iter().filter(|s| *s == selector).count()
    }

    pub fn semantic_attempts(&self) -> usize {
        self.semantic_attempts.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    fn element(&self, selector: &str) -> ElementHandle {
        Arc::new(FakeElement {
            selector: selector.to_string(),
            actions: self.actions.clone(),
        })
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn wait_for_css(
        &self,
        selector: &str,
        _state: ElementState,
        _timeout: Duration,
    ) -> anyhow::Result<ElementHandle> {
        self.attempts.lock().push(selector.to_string());
        if self.present.lock().contains(selector) {
            Ok(self.element(selector))
        } else {
            Err(anyhow!("no element matches {selector}"))
        }
    }

    async fn find_semantic(
        &self,
        query: &SemanticQuery,
        _timeout: Duration,
    ) -> anyhow::Result<ElementHandle> {
        self.semantic_attempts.fetch_add(1, Ordering::SeqCst);
        if self.semantic_hits.lock().contains(query) {
            Ok(self.element(&query.describe()))
        } else {
            Err(anyhow!("no element for {}", query.describe()))
        }
    }

    async fn screenshot_png(&self) -> anyhow::Result<Vec<u8>> {
        if self.screenshot_fails {
            return Err(anyhow!("screenshot unsupported"));
        }
        Ok(b"\x89PNG\r\n\x1a\nfake".to_vec())
    }

    async fn content(&self) -> anyhow::Result<String> {
        Ok(self.html.clone())
    }

    async fn url(&self) -> anyhow::Result<String> {
        if self.url_hangs {
            std::future::pending::<()>().await;
        }
        Ok("https://vendor.example/login".to_string())
    }

    async fn title(&self) -> anyhow::Result<String> {
        Ok("Sign in".to_string())
    }

    async fn viewport(&self) -> anyhow::Result<Viewport> {
        Ok(Viewport {
            width: 1440,
            height: 900,
        })
    }

    async fn cookies(&self) -> anyhow::Result<Vec<CookieInfo>> {
        Ok(vec![CookieInfo {
            name: "session_id".to_string(),
            domain: Some("vendor.example".to_string()),
            path: Some("/".to_string()),
            secure: true,
            http_only: true,
        }])
    }

    async fn storage_keys(&self, kind: StorageKind) -> anyhow::Result<Vec<String>> {
        Ok(match kind {
            StorageKind::Local => vec!["auth_token".to_string()],
            StorageKind::Session => vec!["cart".to_string()],
        })
    }
}

pub struct FakeElement {
    selector: String,
    actions: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PageElement for FakeElement {
    async fn click(&self) -> anyhow::Result<()> {
        self.actions.lock().push(format!("click {}", self.selector));
        Ok(())
    }

    async fn fill(&self, text: &str) -> anyhow::Result<()> {
        self.actions
            .lock()
            .push(format!("fill {} {text}", self.selector));
        Ok(())
    }

    async fn select_option(&self, value: &str) -> anyhow::Result<()> {
        self.actions
            .lock()
            .push(format!("select {} {value}", self.selector));
        Ok(())
    }

    async fn text(&self) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Repair model that always answers with the same JSON value.
pub struct ScriptedLlm {
    reply: Value,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(reply: Value) -> Arc<Self> {
        Self::with_delay(reply, Duration::ZERO)
    }

    /// Answers only after `delay`, like a congested model endpoint.
    pub fn with_delay(reply: Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(
        &self,
        _prompt: &str,
        _system_prompt: Option<&str>,
        _max_tokens: Option<u32>,
        _temperature: Option<f32>,
    ) -> driftguard_common::Result<LlmResponse> {
        Err(DriftError::ExternalRepairUnavailable(
            "free-text generation not scripted".into(),
        ))
    }

    async fn generate_structured(
        &self,
        _prompt: &str,
        _system_prompt: Option<&str>,
        _schema: &OutputSchema,
    ) -> driftguard_common::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.reply.clone())
    }

    async fn health_check(&self) -> driftguard_common::Result<bool> {
        Ok(true)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
