//! Loader for engine settings with YAML + environment overlays.
//!
//! Precedence, lowest to highest: built-in defaults, YAML files and inline
//! snippets in the order they were added, then `DRIFTGUARD__`-prefixed
//! environment variables (`DRIFTGUARD__RESOLUTION__ATTEMPTS_PER_CANDIDATE=5`).
//! `${VAR}` placeholders in any string value are expanded after merging.
use config::{Config, Environment, File};
use driftguard_common::{DriftError, EngineSettings, Result};
use serde_json::Value;
use std::path::Path;

const MAXIMUM_ENV_EXPANSION_DEPTH: usize = 8;
const ENV_PREFIX: &str = "DRIFTGUARD";

fn expand_env_in_value(v: &mut Value) {
    match v {
        Value::String(s) if s.contains('$') => {
            let mut cur = std::mem::take(s);
            for _ in 0..MAXIMUM_ENV_EXPANSION_DEPTH {
                let expanded = shellexpand::env(&cur)
                    .map(|cow| cow.into_owned())
                    .unwrap_or_else(|_| cur.clone());
                if expanded == cur {
                    break;
                }
                cur = expanded;
            }
            *s = cur;
        }
        Value::Array(arr) => arr.iter_mut().for_each(expand_env_in_value),
        Value::Object(obj) => obj.values_mut().for_each(expand_env_in_value),
        _ => {}
    }
}

/// Builder hiding the `config` crate wiring.
pub struct EngineConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for EngineConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfigLoader {
    /// Start from defaults with `DRIFTGUARD__` env overrides.
    ///
    /// ```
    /// use driftguard_config::EngineConfigLoader;
    ///
    /// let settings = EngineConfigLoader::new()
    ///     .with_yaml_str("tenant: es\nrepair:\n  confidence_threshold: 0.8")
    ///     .load()
    ///     .expect("valid config");
    ///
    /// assert_eq!(settings.tenant, "es");
    /// assert_eq!(settings.repair.confidence_threshold, 0.8);
    /// assert_eq!(settings.resolution.attempts_per_candidate, 3);
    /// ```
    pub fn new() -> Self {
        let builder = Config::builder().add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        Self { builder }
    }

    /// Attach a required YAML/TOML/JSON file; the format is inferred from the suffix.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self
            .builder
            .add_source(File::from(path.as_ref()).required(true));
        self
    }

    /// Attach a file that may be absent, so deployments can rely on env only.
    pub fn with_optional_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self
            .builder
            .add_source(File::from(path.as_ref()).required(false));
        self
    }

    /// Merge an inline YAML snippet.
    pub fn with_yaml_str(mut self, yaml: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(yaml, config::FileFormat::Yaml));
        self
    }

    /// Merge all sources, expand `${VAR}` placeholders, and validate.
    ///
    /// ```
    /// use driftguard_common::LlmConfig;
    /// use driftguard_config::EngineConfigLoader;
    ///
    /// unsafe { std::env::set_var("DG_DOC_KEY", "injected-from-env"); }
    ///
    /// let settings = EngineConfigLoader::new()
    ///     .with_yaml_str(r#"
    /// repair:
    ///   llm:
    ///     provider: openai
    ///     model: gpt-4o-mini
    ///     api_key: "${DG_DOC_KEY}"
    /// "#)
    ///     .load()
    ///     .expect("valid configuration");
    ///
    /// match settings.repair.llm {
    ///     LlmConfig::Openai { api_key, endpoint, .. } => {
    ///         assert_eq!(api_key, "injected-from-env");
    ///         assert_eq!(endpoint, "https://api.openai.com/v1");
    ///     }
    ///     other => panic!("expected OpenAI configuration, got {other:?}"),
    /// }
    ///
    /// unsafe { std::env::remove_var("DG_DOC_KEY"); }
    /// ```
    pub fn load(self) -> Result<EngineSettings> {
        let cfg = self.builder.build().map_err(config_error)?;

        let mut v: Value = cfg.try_deserialize().map_err(config_error)?;
        expand_env_in_value(&mut v);

        let settings: EngineSettings = serde_json::from_value(v)
            .map_err(|e| DriftError::ConfigurationInvalid(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

fn config_error(e: config::ConfigError) -> DriftError {
    DriftError::ConfigurationInvalid(e.to_string())
}
