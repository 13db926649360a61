use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use driftguard_common::observability::{init_logging, LogConfig};
use driftguard_common::EngineSettings;
use driftguard_config::EngineConfigLoader;
use driftguard_drivers::webdriver::WebDriverSession;
use driftguard_engine::repository::SelectorSet;
use driftguard_engine::{ForensicRecorder, ResilienceOrchestrator, ResolveOptions};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "driftguard", version, about = "Self-healing element resolution for browser automation")]
struct Cli {
    /// Engine configuration file; missing files fall back to defaults.
    #[arg(long, global = true, env = "DRIFTGUARD_CONFIG", default_value = "driftguard.yaml")]
    config: PathBuf,

    /// Override the configured tenant.
    #[arg(long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open a page and resolve (optionally act on) one logical element.
    Probe {
        #[arg(long)]
        url: String,
        /// Dotted logical path, e.g. `login.submit`.
        #[arg(long)]
        path: String,
        #[arg(long, value_enum)]
        action: Option<Action>,
        /// Text for `fill`, option value for `select`.
        #[arg(long)]
        value: Option<String>,
        /// Natural-language description passed to the repair stage.
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        budget_ms: Option<u64>,
    },
    /// Parse a selector source and report what it defines.
    Validate {
        /// Defaults to the configured selector source.
        #[arg(long)]
        selectors: Option<PathBuf>,
    },
    /// Inspect recorded incidents.
    Incidents {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Show one incident and check its artifact digests.
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Action {
    Click,
    Fill,
    Select,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = EngineConfigLoader::new()
        .with_optional_file(&cli.config)
        .load()
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(tenant) = cli.tenant.clone() {
        settings.tenant = tenant;
    }

    let log_path = init_logging(LogConfig::from_settings("driftguard", &settings.logging))?;
    tracing::debug!(log = %log_path.display(), tenant = %settings.tenant, "app.started");

    match cli.command {
        Command::Probe {
            url,
            path,
            action,
            value,
            description,
            budget_ms,
        } => {
            let mut options = match description {
                Some(d) => ResolveOptions::described(d),
                None => ResolveOptions::default(),
            };
            if let Some(ms) = budget_ms {
                options = options.with_budget(Duration::from_millis(ms));
            }
            options = options.with_context("url", url.clone());
            probe(&settings, &url, &path, action, value.as_deref(), &options).await
        }
        Command::Validate { selectors } => {
            validate(selectors.unwrap_or_else(|| settings.selectors.path.clone()))
        }
        Command::Incidents { limit, id } => incidents(&settings, limit, id.as_deref()).await,
    }
}

async fn probe(
    settings: &EngineSettings,
    url: &str,
    path: &str,
    action: Option<Action>,
    value: Option<&str>,
    options: &ResolveOptions,
) -> Result<()> {
    if matches!(action, Some(Action::Fill | Action::Select)) && value.is_none() {
        bail!("--value is required for fill and select");
    }

    let engine = ResilienceOrchestrator::from_settings(settings).await?;
    let session = WebDriverSession::connect(&settings.webdriver).await?;

    let outcome = async {
        let page = session.goto(url).await?;
        let value = value.unwrap_or_default();
        match action {
            Some(Action::Click) => engine.safe_click(&page, path, options).await?,
            Some(Action::Fill) => engine.safe_fill(&page, path, value, options).await?,
            Some(Action::Select) => engine.safe_select(&page, path, value, options).await?,
            None => {
                let element = engine.find_element(&page, path, options).await?;
                let text = element.text().await.unwrap_or_default();
                println!("resolved {path}: {text:?}");
            }
        }
        anyhow::Ok(())
    }
    .await;

    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "app.session_close_failed");
    }
    println!("{}", serde_json::to_string_pretty(&engine.get_status())?);
    outcome
}

fn validate(source: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&source)
        .with_context(|| format!("reading {}", source.display()))?;
    let set = SelectorSet::parse(&text)?;
    println!(
        "{}: {} definitions across {:?}",
        source.display(),
        set.definition_count(),
        set.tenants()
    );
    Ok(())
}

async fn incidents(settings: &EngineSettings, limit: usize, id: Option<&str>) -> Result<()> {
    let recorder = ForensicRecorder::open(&settings.forensics, &settings.tenant).await?;

    let Some(id) = id else {
        let recent = recorder.get_recent(limit);
        println!("{}", serde_json::to_string_pretty(&recent)?);
        return Ok(());
    };

    let incident = recorder
        .get_by_id(id)
        .await
        .with_context(|| format!("no incident {id}"))?;
    let integrity = recorder.verify(id).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "incident": incident,
            "integrity": integrity,
        }))?
    );
    Ok(())
}
