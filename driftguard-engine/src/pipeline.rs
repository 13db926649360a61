//! Three-stage element resolution: semantic lookup, learned CSS fallbacks
//! with backoff, then optional AI repair.
//!
//! "Not found" is a value ([`Resolution::NotFound`]) inside the pipeline and
//! only becomes a [`DriftError`] at the orchestrator boundary.
use crate::repair::{RepairRequest, SelectorRepairer};
use crate::repository::SelectorStore;
use driftguard_common::{DriftError, ResolutionSettings, ResolutionStage};
use driftguard_drivers::{BrowserPage, ElementHandle, ElementState};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A request to locate the element behind a selector path.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest<'a> {
    pub path: &'a str,
    /// Human-readable description handed to the repair model; defaults to the path.
    pub description: Option<&'a str>,
    /// Overall time budget; defaults to `resolution.total_budget_ms`.
    pub budget: Option<Duration>,
}

pub struct ResolvedElement {
    pub handle: ElementHandle,
    pub selector: String,
    pub stage: ResolutionStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub path: String,
    /// Every CSS candidate that was exhausted, in the order tried.
    pub tried: Vec<String>,
    pub stage_reached: ResolutionStage,
}

impl NotFound {
    pub fn into_error(self, action: Option<String>) -> DriftError {
        DriftError::ElementNotResolved {
            path: self.path,
            tried: self.tried,
            stage: self.stage_reached,
            action,
        }
    }
}

pub enum Resolution {
    Found(ResolvedElement),
    NotFound(NotFound),
}

#[derive(Debug, Default)]
struct PipelineStats {
    requests: AtomicU64,
    semantic_hits: AtomicU64,
    css_hits: AtomicU64,
    ai_hits: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    pub requests: u64,
    pub semantic_hits: u64,
    pub css_hits: u64,
    pub ai_hits: u64,
    pub failures: u64,
}

pub struct ResolutionPipeline {
    store: Arc<dyn SelectorStore>,
    repairer: Option<Arc<SelectorRepairer>>,
    settings: ResolutionSettings,
    stats: PipelineStats,
}

struct Budget {
    deadline: Instant,
}

impl Budget {
    fn new(total: Duration) -> Self {
        Self {
            deadline: deadline_after(total),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

// Budgets too large for the clock are clamped to a year out.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub(crate) fn deadline_after(total: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(total)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Drop repeated selectors, keeping the first occurrence and its index.
fn dedup_candidates(ordered: Vec<(usize, String)>) -> Vec<(usize, String)> {
    let mut seen = HashSet::new();
    ordered
        .into_iter()
        .filter(|(_, selector)| seen.insert(selector.clone()))
        .collect()
}

impl ResolutionPipeline {
    pub fn new(
        store: Arc<dyn SelectorStore>,
        repairer: Option<Arc<SelectorRepairer>>,
        settings: ResolutionSettings,
    ) -> Self {
        Self {
            store,
            repairer,
            settings,
            stats: PipelineStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SelectorStore> {
        &self.store
    }

    pub fn repairer(&self) -> Option<&Arc<SelectorRepairer>> {
        self.repairer.as_ref()
    }

    fn element_state(&self) -> ElementState {
        if self.settings.require_visible {
            ElementState::Visible
        } else {
            ElementState::Attached
        }
    }

    pub async fn resolve(&self, page: &dyn BrowserPage, request: &ResolveRequest<'_>) -> Resolution {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let path = request.path;
        let budget = Budget::new(request.budget.unwrap_or_else(|| self.settings.total_budget()));

        if let Some(found) = self.semantic_stage(page, path, &budget).await {
            self.stats.semantic_hits.fetch_add(1, Ordering::Relaxed);
            return Resolution::Found(found);
        }

        let tried = match self.css_stage(page, path, &budget).await {
            Ok(found) => {
                self.stats.css_hits.fetch_add(1, Ordering::Relaxed);
                return Resolution::Found(found);
            }
            Err(tried) => tried,
        };

        let mut stage_reached = ResolutionStage::Css;
        let repairer = self.repairer.as_ref().filter(|r| r.is_available());
        if repairer.is_some() && budget.remaining().is_zero() {
            tracing::debug!(%path, "pipeline.ai.skipped_budget_spent");
        }
        if let Some(repairer) = repairer.filter(|_| !budget.remaining().is_zero()) {
            stage_reached = ResolutionStage::Ai;
            let broken = tried
                .first()
                .cloned()
                .or_else(|| self.store.get(path))
                .unwrap_or_default();
            let repair = RepairRequest {
                path,
                broken_selector: &broken,
                description: request.description.unwrap_or(path),
                state: self.element_state(),
                timeout: budget.remaining(),
            };
            if let Some(repaired) = repairer.repair(page, self.store.as_ref(), &repair).await {
                self.stats.ai_hits.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    %path,
                    selector = %repaired.selector,
                    confidence = repaired.confidence,
                    "pipeline.ai.resolved"
                );
                return Resolution::Found(ResolvedElement {
                    handle: repaired.handle,
                    selector: repaired.selector,
                    stage: ResolutionStage::Ai,
                });
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%path, tried = tried.len(), stage = %stage_reached, "pipeline.not_found");
        Resolution::NotFound(NotFound {
            path: path.to_string(),
            tried,
            stage_reached,
        })
    }

    async fn semantic_stage(
        &self,
        page: &dyn BrowserPage,
        path: &str,
        budget: &Budget,
    ) -> Option<ResolvedElement> {
        let query = self.store.get_semantic(path).filter(|q| !q.is_empty())?;
        let timeout = self.settings.semantic_timeout().min(budget.remaining());
        if timeout.is_zero() {
            return None;
        }
        match page.find_semantic(&query, timeout).await {
            Ok(handle) => {
                let selector = query.describe();
                tracing::info!(%path, %selector, "pipeline.semantic.resolved");
                Some(ResolvedElement {
                    handle,
                    selector,
                    stage: ResolutionStage::Semantic,
                })
            }
            Err(e) => {
                tracing::debug!(%path, query = %query.describe(), error = %e, "pipeline.semantic.miss");
                None
            }
        }
    }

    /// Try every distinct candidate in learned order. On failure returns the
    /// selectors that were exhausted.
    async fn css_stage(
        &self,
        page: &dyn BrowserPage,
        path: &str,
        budget: &Budget,
    ) -> Result<ResolvedElement, Vec<String>> {
        let candidates = self.store.get_with_fallback(path);
        if candidates.is_empty() {
            tracing::warn!(%path, "pipeline.css.unknown_path");
            return Err(Vec::new());
        }

        let learner = self.store.learner();
        let ordered = dedup_candidates(learner.get_optimized_order(path, &candidates));
        let state = self.element_state();
        let floor = self.settings.min_attempt_timeout();
        let mut tried = Vec::with_capacity(ordered.len());

        for (index, selector) in ordered {
            for attempt in 0..self.settings.attempts_per_candidate {
                let timeout = if attempt == 0 {
                    // the first attempt on every candidate always runs
                    self.settings.attempt_timeout(0).min(budget.remaining()).max(floor)
                } else {
                    let backoff = self.settings.backoff_before(attempt).min(budget.remaining());
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    let timeout = self.settings.attempt_timeout(attempt).min(budget.remaining());
                    if timeout.is_zero() {
                        break;
                    }
                    timeout
                };

                match page.wait_for_css(&selector, state, timeout).await {
                    Ok(handle) => {
                        learner.record_success(path, index);
                        tracing::info!(%path, index, attempt, %selector, "pipeline.css.resolved");
                        return Ok(ResolvedElement {
                            handle,
                            selector,
                            stage: ResolutionStage::Css,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(
                            %path,
                            index,
                            attempt,
                            timeout_ms = timeout.as_millis() as u64,
                            error = %e,
                            "pipeline.css.attempt_failed"
                        );
                    }
                }
            }
            learner.record_failure(path, index);
            tried.push(selector);
        }
        Err(tried)
    }

    pub fn status(&self) -> PipelineStatus {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStatus {
            requests: load(&self.stats.requests),
            semantic_hits: load(&self.stats.semantic_hits),
            css_hits: load(&self.stats.css_hits),
            ai_hits: load(&self.stats.ai_hits),
            failures: load(&self.stats.failures),
        }
    }
}
