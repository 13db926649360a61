//! Common types shared across the driftguard crates.
//!
//! This crate defines the engine settings model, the error taxonomy, and the
//! observability helpers used throughout the workspace. It stays
//! dependency‑light so that every crate can depend on it.
//!
//! # Overview
//!
//! - [`EngineSettings`]: every tunable of the selector resilience engine
//! - [`LlmConfig`]: provider‑agnostic configuration for the repair model
//! - [`observability`]: centralised tracing/logging initialisation
//! - [`DriftError`] and [`Result`]: shared error handling
//!
//! # Examples
//!
//! ```rust
//! use driftguard_common::EngineSettings;
//!
//! let cfg = EngineSettings::default();
//! assert_eq!(cfg.resolution.attempts_per_candidate, 3);
//! assert!(cfg.validate().is_ok());
//! ```
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod observability;

/// Configuration for the model used by the AI repair stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum LlmConfig {
    Openai {
        model: String,
        api_key: String,
        #[serde(default = "default_openai_endpoint")]
        endpoint: String,
        #[serde(default)]
        temperature: Option<f32>,
    },
    Ollama {
        model: String,
        #[serde(default = "default_ollama_endpoint")]
        endpoint: String,
        #[serde(default)]
        temperature: Option<f32>,
    },
    #[default]
    None,
}

fn default_openai_endpoint() -> String {
    "https://api.openai.com/v1".into()
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".into()
}

/// Top‑level settings for one engine instance (one tenant, one browser session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Tenant scope this instance resolves selectors for.
    pub tenant: String,
    pub selectors: SelectorSourceSettings,
    pub hot_reload: HotReloadSettings,
    pub resolution: ResolutionSettings,
    pub repair: RepairSettings,
    pub forensics: ForensicsSettings,
    pub webdriver: WebDriverSettings,
    pub logging: LoggingSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            selectors: SelectorSourceSettings::default(),
            hot_reload: HotReloadSettings::default(),
            resolution: ResolutionSettings::default(),
            repair: RepairSettings::default(),
            forensics: ForensicsSettings::default(),
            webdriver: WebDriverSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Reject settings that would break the resolution contract.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(DriftError::ConfigurationInvalid(msg.to_string()));

        if self.tenant.trim().is_empty() {
            return invalid("tenant must not be empty");
        }
        if self.resolution.attempts_per_candidate == 0 {
            return invalid("resolution.attempts_per_candidate must be at least 1");
        }
        if self.resolution.timeout_growth < 1.0 || !self.resolution.timeout_growth.is_finite() {
            return invalid("resolution.timeout_growth must be >= 1.0");
        }
        if self.resolution.backoff_factor < 1.0 || !self.resolution.backoff_factor.is_finite() {
            return invalid("resolution.backoff_factor must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.repair.confidence_threshold) {
            return invalid("repair.confidence_threshold must be within [0, 1]");
        }
        if self.repair.max_html_chars == 0 {
            return invalid("repair.max_html_chars must be positive");
        }
        if self.forensics.max_incidents_per_tenant == 0 {
            return invalid("forensics.max_incidents_per_tenant must be positive");
        }
        if self.hot_reload.poll_interval_ms == 0 {
            return invalid("hot_reload.poll_interval_ms must be positive");
        }
        Ok(())
    }
}

/// Where selector definitions come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSourceSettings {
    pub path: PathBuf,
    /// Scope consulted when the tenant has no entry for a path.
    pub default_scope: String,
}

impl Default for SelectorSourceSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("selectors.yaml"),
            default_scope: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

impl Default for HotReloadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5_000,
        }
    }
}

impl HotReloadSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Timing knobs for the semantic and CSS stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionSettings {
    pub semantic_timeout_ms: u64,
    pub attempts_per_candidate: u32,
    /// Timeout of the first attempt on a candidate.
    pub attempt_timeout_ms: u64,
    /// Each further attempt waits `timeout_growth` times longer.
    pub timeout_growth: f64,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    /// Lower bound for an attempt timeout; every candidate gets one attempt
    /// of at least this length even when the caller budget is spent.
    pub min_attempt_timeout_ms: u64,
    /// Budget used when the caller does not pass one.
    pub total_budget_ms: u64,
    /// Require the element to be displayed, not just attached.
    pub require_visible: bool,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            semantic_timeout_ms: 2_000,
            attempts_per_candidate: 3,
            attempt_timeout_ms: 1_000,
            timeout_growth: 1.5,
            backoff_base_ms: 100,
            backoff_factor: 2.0,
            min_attempt_timeout_ms: 250,
            total_budget_ms: 30_000,
            require_visible: true,
        }
    }
}

impl ResolutionSettings {
    /// Timeout for attempt number `attempt` (zero based).
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let ms = self.attempt_timeout_ms as f64 * self.timeout_growth.powi(attempt as i32);
        Duration::from_millis(ms.round() as u64)
    }

    /// Delay slept before attempt number `attempt` (zero based, none before the first).
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = self.backoff_base_ms as f64 * self.backoff_factor.powi(attempt as i32 - 1);
        Duration::from_millis(ms.round() as u64)
    }

    pub fn semantic_timeout(&self) -> Duration {
        Duration::from_millis(self.semantic_timeout_ms)
    }

    pub fn min_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.min_attempt_timeout_ms)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_millis(self.total_budget_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairSettings {
    pub enabled: bool,
    pub confidence_threshold: f64,
    pub max_html_chars: usize,
    pub validation_timeout_ms: u64,
    pub llm: LlmConfig,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
            max_html_chars: 50_000,
            validation_timeout_ms: 5_000,
            llm: LlmConfig::None,
        }
    }
}

impl RepairSettings {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForensicsSettings {
    pub enabled: bool,
    pub root_dir: PathBuf,
    pub max_incidents_per_tenant: usize,
    pub max_dom_chars: usize,
    /// Incidents kept in memory for `get_recent` / `get_by_id`.
    pub recent_buffer: usize,
}

impl Default for ForensicsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: PathBuf::from("incidents"),
            max_incidents_per_tenant: 100,
            max_dom_chars: 500_000,
            recent_buffer: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverSettings {
    pub url: String,
    pub headless: bool,
}

impl Default for WebDriverSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9515".to_string(),
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub json: bool,
    pub stderr: bool,
    pub dir: Option<PathBuf>,
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            json: false,
            stderr: true,
            dir: None,
            filter: "info".to_string(),
        }
    }
}

/// Stage of the resolution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStage {
    Semantic,
    Css,
    Ai,
}

impl fmt::Display for ResolutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionStage::Semantic => "semantic",
            ResolutionStage::Css => "css",
            ResolutionStage::Ai => "ai",
        };
        f.write_str(s)
    }
}

/// Error types used across driftguard.
#[derive(thiserror::Error, Debug)]
pub enum DriftError {
    /// The selector source or engine settings were malformed.
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Every resolution stage was exhausted without finding the element.
    #[error("Element not resolved: {path} (last stage {stage}, tried {tried:?})")]
    ElementNotResolved {
        path: String,
        tried: Vec<String>,
        stage: ResolutionStage,
        action: Option<String>,
    },

    /// The AI repair service is absent, misconfigured, or failing.
    #[error("External repair unavailable: {0}")]
    ExternalRepairUnavailable(String),

    /// One forensic artifact could not be written.
    #[error("Capture of {artifact} failed: {message}")]
    CaptureSubsystem { artifact: String, message: String },

    /// A driver (browser, network, etc.) reported an error.
    #[error("Driver error: {0}")]
    Driver(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded the configured timeout.
    #[error("Timeout occurred")]
    Timeout,
}

impl DriftError {
    /// Short machine-readable kind, used in incident records.
    pub fn kind(&self) -> &'static str {
        match self {
            DriftError::ConfigurationInvalid(_) => "configuration_invalid",
            DriftError::ElementNotResolved { .. } => "element_not_resolved",
            DriftError::ExternalRepairUnavailable(_) => "external_repair_unavailable",
            DriftError::CaptureSubsystem { .. } => "capture_subsystem_error",
            DriftError::Driver(_) => "driver",
            DriftError::Io(_) => "io",
            DriftError::Timeout => "timeout",
        }
    }
}

/// Convenient alias for results that use [`DriftError`].
pub type Result<T> = std::result::Result<T, DriftError>;
