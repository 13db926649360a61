use std::sync::OnceLock;

use driftguard_common::observability::{LogConfig, LogFormat};

static INIT_PATH: OnceLock<std::path::PathBuf> = OnceLock::new();

pub fn init_test_tracing() {
    let _ = INIT_PATH.get_or_init(|| {
        let config = LogConfig {
            app_name: "driftguard-tests".to_string(),
            log_dir: Some(std::env::temp_dir().join("driftguard-tests")),
            emit_stderr: true,
            format: LogFormat::Text,
            default_filter: "debug".to_string(),
        };

        driftguard_common::observability::init_logging(config).unwrap_or_default()
    });
}
