//! Facade handed to workflow code: resolve-then-act primitives, hot-reload
//! lifecycle, and an aggregated status view.
use crate::forensics::{ForensicRecorder, RecorderStatus};
use crate::hot_reload::{HotReloadStatus, HotReloadSupervisor};
use crate::learner::LearnerStatus;
use crate::pipeline::{PipelineStatus, Resolution, ResolutionPipeline, ResolveRequest};
use crate::repair::{RepairStatus, SelectorRepairer};
use crate::repository::{ReloadOutcome, RepositoryStatus, SelectorRepository, SelectorStore};
use driftguard_common::{EngineSettings, Result};
use driftguard_drivers::{BrowserPage, ElementHandle};
use driftguard_llm::ensure_llm_ready;
use driftguard_llm::traits::LlmClient;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-call knobs for the facade operations.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Description of the element for AI repair, e.g. "the login email field".
    pub description: Option<String>,
    pub budget: Option<Duration>,
    /// Caller context stored with any incident this call produces.
    pub context: BTreeMap<String, String>,
}

impl ResolveOptions {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub tenant: String,
    pub repository: RepositoryStatus,
    pub learner: LearnerStatus,
    pub hot_reload: HotReloadStatus,
    pub repair: RepairStatus,
    pub resolutions: PipelineStatus,
    pub incidents: Option<RecorderStatus>,
}

pub struct ResilienceOrchestrator {
    tenant: String,
    repository: Arc<SelectorRepository>,
    pipeline: ResolutionPipeline,
    recorder: Option<Arc<ForensicRecorder>>,
    supervisor: HotReloadSupervisor,
    hot_reload_enabled: bool,
}

impl ResilienceOrchestrator {
    /// Build every component from settings: selector source, forensic store
    /// and, when configured, the repair model.
    pub async fn from_settings(settings: &EngineSettings) -> Result<Self> {
        settings.validate()?;
        let repository =
            Arc::new(SelectorRepository::open(&settings.selectors, &settings.tenant).await?);

        let recorder = if settings.forensics.enabled {
            Some(Arc::new(
                ForensicRecorder::open(&settings.forensics, &settings.tenant).await?,
            ))
        } else {
            None
        };

        let llm: Option<Arc<dyn LlmClient>> = if settings.repair.enabled {
            match ensure_llm_ready(&settings.repair.llm).await {
                Ok(client) => Some(client as Arc<dyn LlmClient>),
                Err(e) => {
                    tracing::warn!(error = %e, "orchestrator.repair.disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self::new(settings, repository, llm, recorder))
    }

    /// Assemble from already-built parts.
    pub fn new(
        settings: &EngineSettings,
        repository: Arc<SelectorRepository>,
        llm: Option<Arc<dyn LlmClient>>,
        recorder: Option<Arc<ForensicRecorder>>,
    ) -> Self {
        let store: Arc<dyn SelectorStore> = repository.clone();
        let repairer = Arc::new(SelectorRepairer::new(llm, settings.repair.clone()));
        let pipeline =
            ResolutionPipeline::new(store.clone(), Some(repairer), settings.resolution.clone());
        let supervisor = HotReloadSupervisor::new(store, settings.hot_reload.poll_interval());
        Self {
            tenant: settings.tenant.clone(),
            repository,
            pipeline,
            recorder,
            supervisor,
            hot_reload_enabled: settings.hot_reload.enabled,
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn repository(&self) -> &Arc<SelectorRepository> {
        &self.repository
    }

    pub fn recorder(&self) -> Option<&Arc<ForensicRecorder>> {
        self.recorder.as_ref()
    }

    async fn resolve_for(
        &self,
        page: &dyn BrowserPage,
        path: &str,
        options: &ResolveOptions,
        action: Option<&str>,
    ) -> Result<ElementHandle> {
        let request = ResolveRequest {
            path,
            description: options.description.as_deref(),
            budget: options.budget,
        };
        match self.pipeline.resolve(page, &request).await {
            Resolution::Found(found) => {
                tracing::debug!(%path, stage = %found.stage, selector = %found.selector, "orchestrator.resolved");
                Ok(found.handle)
            }
            Resolution::NotFound(not_found) => {
                let tried = not_found.tried.clone();
                let err = not_found.into_error(action.map(str::to_string));
                if let Some(recorder) = &self.recorder {
                    let incident = recorder.capture(page, &err, &options.context, &tried).await;
                    tracing::warn!(%path, incident = %incident.id, "orchestrator.element_not_resolved");
                }
                Err(err)
            }
        }
    }

    pub async fn find_element(
        &self,
        page: &dyn BrowserPage,
        path: &str,
        options: &ResolveOptions,
    ) -> Result<ElementHandle> {
        self.resolve_for(page, path, options, None).await
    }

    pub async fn safe_click(
        &self,
        page: &dyn BrowserPage,
        path: &str,
        options: &ResolveOptions,
    ) -> Result<()> {
        let element = self.resolve_for(page, path, options, Some("click")).await?;
        element.click().await?;
        Ok(())
    }

    pub async fn safe_fill(
        &self,
        page: &dyn BrowserPage,
        path: &str,
        value: &str,
        options: &ResolveOptions,
    ) -> Result<()> {
        let element = self.resolve_for(page, path, options, Some("fill")).await?;
        element.fill(value).await?;
        Ok(())
    }

    pub async fn safe_select(
        &self,
        page: &dyn BrowserPage,
        path: &str,
        value: &str,
        options: &ResolveOptions,
    ) -> Result<()> {
        let element = self.resolve_for(page, path, options, Some("select")).await?;
        element.select_option(value).await?;
        Ok(())
    }

    /// Start watching the selector source. No-op when hot reload is disabled
    /// or already running.
    pub fn start(&self) -> bool {
        if !self.hot_reload_enabled {
            tracing::debug!("orchestrator.hot_reload.disabled");
            return false;
        }
        self.supervisor.start()
    }

    pub async fn stop(&self) -> bool {
        self.supervisor.stop().await
    }

    /// Re-read the selector source now, without waiting for the poller.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        self.repository.reload().await
    }

    pub fn get_status(&self) -> EngineStatus {
        EngineStatus {
            tenant: self.tenant.clone(),
            repository: self.repository.status(),
            learner: self.repository.learner().status(),
            hot_reload: self.supervisor.status(),
            repair: self
                .pipeline
                .repairer()
                .map(|r| r.status())
                .unwrap_or_default(),
            resolutions: self.pipeline.status(),
            incidents: self.recorder.as_ref().map(|r| r.status()),
        }
    }
}
