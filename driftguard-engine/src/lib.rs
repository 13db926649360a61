//! Selector resilience engine.
//!
//! Resolves logical selector paths (`login.email`) to live elements through
//! a semantic lookup, learned CSS fallbacks with backoff, and optional AI
//! repair. Total failures leave a forensic incident on disk.
//!
//! - [`repository`]: tenant-scoped selector definitions with atomic reload
//! - [`learner`]: success/failure counters used to re-rank fallbacks
//! - [`hot_reload`]: background poller for the selector source
//! - [`repair`]: HTML sanitizer and schema-constrained repair client
//! - [`pipeline`]: the staged resolution state machine
//! - [`forensics`]: incident capture, retention and retrieval
//! - [`orchestrator`]: the facade workflow code talks to
mod atomic;
pub mod forensics;
pub mod hot_reload;
pub mod learner;
pub mod orchestrator;
pub mod pipeline;
pub mod repair;
pub mod repository;

pub use forensics::{ForensicRecorder, Incident};
pub use hot_reload::HotReloadSupervisor;
pub use learner::SelectorLearner;
pub use orchestrator::{EngineStatus, ResilienceOrchestrator, ResolveOptions};
pub use pipeline::{Resolution, ResolutionPipeline, ResolveRequest};
pub use repair::{RepairResult, SelectorRepairer};
pub use repository::{ReloadOutcome, SelectorDefinition, SelectorRepository, SelectorStore};
