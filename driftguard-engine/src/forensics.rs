//! Evidence bundles captured when an element cannot be resolved.
//!
//! Layout: `<root>/<tenant>/<YYYY-MM-DD>/<id>.{png,html,json}` where `id` is a
//! UUIDv7. The JSON file is the context document and doubles as the incident
//! record. Retention counts every `<id>` stem, so artifacts of a capture that
//! never reached its JSON are still evicted in age order.
use crate::atomic::write_atomic;
use crate::repair::sanitize::truncate_chars;
use chrono::{DateTime, Utc};
use driftguard_common::{DriftError, ForensicsSettings, ResolutionStage};
use driftguard_drivers::{BrowserPage, CookieInfo, StorageKind, Viewport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;
use walkdir::WalkDir;

const MASK: &str = "***";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// Hex BLAKE3 digest of the bytes written.
    pub blake3: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentCaptures {
    pub screenshot: Option<ArtifactRef>,
    pub dom: Option<ArtifactRef>,
    pub context: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant: String,
    pub error_kind: String,
    pub error_message: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub stage: Option<ResolutionStage>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub tried_selectors: Vec<String>,
    #[serde(default)]
    pub dom_truncated: bool,
    pub captures: IncidentCaptures,
    #[serde(default)]
    pub capture_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MaskedCookie {
    #[serde(flatten)]
    meta: CookieInfo,
    value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PageContext {
    url: Option<String>,
    title: Option<String>,
    viewport: Option<Viewport>,
    cookies: Vec<MaskedCookie>,
    local_storage: BTreeMap<String, String>,
    session_storage: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextDocument {
    incident: Incident,
    page: PageContext,
    stack_trace: String,
}

/// Result of re-hashing an incident's artifacts. `None` means the artifact
/// was never captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub id: String,
    pub screenshot_intact: Option<bool>,
    pub dom_intact: Option<bool>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.screenshot_intact != Some(false) && self.dom_intact != Some(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub root: PathBuf,
    pub tenant: String,
    pub max_incidents: usize,
    pub captured: u64,
    pub capture_errors: u64,
    pub evicted: u64,
    pub in_memory: usize,
}

/// Every file sharing one `<id>` stem inside a date partition.
#[derive(Debug)]
struct StoredIncident {
    id: String,
    dir: PathBuf,
    files: Vec<PathBuf>,
    /// Newest mtime among `files`.
    modified: SystemTime,
}

impl StoredIncident {
    fn record(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.id))
    }

    fn has_record(&self) -> bool {
        self.files.iter().any(|f| f.extension().is_some_and(|e| e == "json"))
    }
}

pub struct ForensicRecorder {
    root: PathBuf,
    tenant: String,
    tenant_dir: PathBuf,
    max_incidents: usize,
    max_dom_chars: usize,
    recent_capacity: usize,
    recent: Mutex<VecDeque<Incident>>,
    captured: AtomicU64,
    capture_errors: AtomicU64,
    evicted: AtomicU64,
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// Directory-safe form of a tenant key.
fn partition_name(tenant: &str) -> String {
    tenant
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Files directly under `<tenant>/<date>/` grouped by stem, unordered.
/// Dot-files are in-flight temporaries and are skipped.
fn list_stored(tenant_dir: &Path) -> Vec<StoredIncident> {
    let mut stems: BTreeMap<(PathBuf, String), StoredIncident> = BTreeMap::new();
    for entry in WalkDir::new(tenant_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let id = name.split('.').next().unwrap_or(name).to_string();
        let (Some(dir), Some(modified)) = (
            entry.path().parent().map(Path::to_path_buf),
            entry.metadata().ok().and_then(|m| m.modified().ok()),
        ) else {
            continue;
        };
        let stored = stems
            .entry((dir.clone(), id.clone()))
            .or_insert_with(|| StoredIncident {
                id,
                dir,
                files: Vec::new(),
                modified,
            });
        stored.modified = stored.modified.max(modified);
        stored.files.push(entry.into_path());
    }
    stems.into_values().collect()
}

/// Oldest first; ids are time-sortable so they settle equal mtimes.
fn sort_oldest_first(stored: &mut [StoredIncident]) {
    stored.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));
}

fn remove_incident_files(stored: &StoredIncident) {
    for file in &stored.files {
        match std::fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(file = %file.display(), error = %e, "forensics.evict.remove_failed"),
        }
    }
    // drop the date partition once it is empty; fails harmlessly otherwise
    let _ = std::fs::remove_dir(&stored.dir);
}

fn prune(tenant_dir: &Path, max: usize) -> Vec<String> {
    let mut stored = list_stored(tenant_dir);
    if stored.len() <= max {
        return Vec::new();
    }
    sort_oldest_first(&mut stored);
    let excess = stored.len() - max;
    stored
        .iter()
        .take(excess)
        .map(|s| {
            remove_incident_files(s);
            s.id.clone()
        })
        .collect()
}

fn read_document(file: &Path) -> Option<ContextDocument> {
    let text = std::fs::read_to_string(file).ok()?;
    match serde_json::from_str(&text) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!(file = %file.display(), error = %e, "forensics.record.unreadable");
            None
        }
    }
}

fn find_document(root: &Path, id: &str) -> Option<PathBuf> {
    let wanted = format!("{id}.json");
    WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name().to_str() == Some(wanted.as_str()))
        .map(|entry| entry.into_path())
}

impl ForensicRecorder {
    /// Open the store under `settings.root_dir` and load the newest records
    /// of `tenant` into memory.
    pub async fn open(settings: &ForensicsSettings, tenant: &str) -> driftguard_common::Result<Self> {
        let tenant_dir = settings.root_dir.join(partition_name(tenant));
        tokio::fs::create_dir_all(&tenant_dir).await?;

        let recent_capacity = settings.recent_buffer.max(1);
        let dir = tenant_dir.clone();
        let hydrated = tokio::task::spawn_blocking(move || {
            let mut stored = list_stored(&dir);
            sort_oldest_first(&mut stored);
            stored.retain(StoredIncident::has_record);
            let skip = stored.len().saturating_sub(recent_capacity);
            stored
                .iter()
                .skip(skip)
                .filter_map(|s| read_document(&s.record()))
                .map(|doc| doc.incident)
                .collect::<VecDeque<_>>()
        })
        .await
        .map_err(|e| DriftError::Io(std::io::Error::other(e)))?;

        tracing::info!(
            root = %settings.root_dir.display(),
            %tenant,
            hydrated = hydrated.len(),
            "forensics.opened"
        );
        Ok(Self {
            root: settings.root_dir.clone(),
            tenant: tenant.to_string(),
            tenant_dir,
            max_incidents: settings.max_incidents_per_tenant,
            max_dom_chars: settings.max_dom_chars,
            recent_capacity,
            recent: Mutex::new(hydrated),
            captured: AtomicU64::new(0),
            capture_errors: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    /// Capture screenshot, DOM and context for a failed resolution.
    ///
    /// Each artifact is attempted independently; failures are listed in
    /// `capture_errors` and never prevent the others or the returned record.
    /// The incident is counted and kept in memory even when nothing could be
    /// written.
    pub async fn capture(
        &self,
        page: &dyn BrowserPage,
        error: &DriftError,
        context: &BTreeMap<String, String>,
        tried: &[String],
    ) -> Incident {
        let id = Uuid::now_v7().to_string();
        let timestamp = Utc::now();
        let dir = self
            .tenant_dir
            .join(timestamp.format("%Y-%m-%d").to_string());

        let (path, action, stage) = match error {
            DriftError::ElementNotResolved {
                path,
                stage,
                action,
                ..
            } => (Some(path.clone()), action.clone(), Some(*stage)),
            _ => (None, None, None),
        };
        let mut incident = Incident {
            id: id.clone(),
            timestamp,
            tenant: self.tenant.clone(),
            error_kind: error.kind().to_string(),
            error_message: error.to_string(),
            path,
            action,
            stage,
            context: context.clone(),
            tried_selectors: tried.to_vec(),
            dom_truncated: false,
            captures: IncidentCaptures::default(),
            capture_errors: Vec::new(),
        };

        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => self.write_artifacts(page, &dir, &mut incident).await,
            Err(e) => self.note_failure(&mut incident, "partition", e.to_string()),
        }

        self.captured.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = self.recent.lock();
            recent.push_back(incident.clone());
            while recent.len() > self.recent_capacity {
                recent.pop_front();
            }
        }
        tracing::warn!(
            incident = %incident.id,
            tenant = %incident.tenant,
            kind = %incident.error_kind,
            capture_errors = incident.capture_errors.len(),
            "forensics.incident.captured"
        );

        self.enforce_retention().await;
        incident
    }

    async fn write_artifacts(&self, page: &dyn BrowserPage, dir: &Path, incident: &mut Incident) {
        let id = incident.id.clone();
        match page.screenshot_png().await {
            Ok(png) => match self.write_artifact(dir, &format!("{id}.png"), png).await {
                Ok(artifact) => incident.captures.screenshot = Some(artifact),
                Err(e) => self.note_failure(incident, "screenshot", e.to_string()),
            },
            Err(e) => self.note_failure(incident, "screenshot", e.to_string()),
        }

        match page.content().await {
            Ok(html) => {
                let (dom, truncated) = self.truncate_dom(&html);
                incident.dom_truncated = truncated;
                match self.write_artifact(dir, &format!("{id}.html"), dom.into_bytes()).await {
                    Ok(artifact) => incident.captures.dom = Some(artifact),
                    Err(e) => self.note_failure(incident, "dom", e.to_string()),
                }
            }
            Err(e) => self.note_failure(incident, "dom", e.to_string()),
        }

        let page_context = self.page_context(page, incident).await;
        let context_path = dir.join(format!("{id}.json"));
        incident.captures.context = Some(context_path.clone());
        let document = ContextDocument {
            incident: incident.clone(),
            page: page_context,
            stack_trace: std::backtrace::Backtrace::force_capture().to_string(),
        };
        let written = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => write_atomic(&context_path, bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            incident.captures.context = None;
            self.note_failure(incident, "context", e);
        }
    }

    fn note_failure(&self, incident: &mut Incident, artifact: &str, message: String) {
        self.capture_errors.fetch_add(1, Ordering::Relaxed);
        let err = DriftError::CaptureSubsystem {
            artifact: artifact.to_string(),
            message,
        };
        tracing::warn!(incident = %incident.id, error = %err, "forensics.capture.failed");
        incident.capture_errors.push(err.to_string());
    }

    fn truncate_dom(&self, html: &str) -> (String, bool) {
        let (kept, truncated) = truncate_chars(html, self.max_dom_chars);
        if !truncated {
            return (html.to_string(), false);
        }
        let total = html.chars().count();
        let marked = format!(
            "{kept}\n<!-- driftguard: DOM truncated to {} of {total} characters -->\n",
            self.max_dom_chars
        );
        (marked, true)
    }

    async fn write_artifact(
        &self,
        dir: &Path,
        name: &str,
        bytes: Vec<u8>,
    ) -> std::io::Result<ArtifactRef> {
        let path = dir.join(name);
        let blake3 = digest(&bytes);
        let len = bytes.len() as u64;
        write_atomic(&path, bytes).await?;
        Ok(ArtifactRef {
            path,
            blake3,
            bytes: len,
        })
    }

    async fn page_context(&self, page: &dyn BrowserPage, incident: &mut Incident) -> PageContext {
        let mut ctx = PageContext::default();

        match page.url().await {
            Ok(url) => ctx.url = Some(url),
            Err(e) => self.note_failure(incident, "url", e.to_string()),
        }
        match page.title().await {
            Ok(title) => ctx.title = Some(title),
            Err(e) => self.note_failure(incident, "title", e.to_string()),
        }
        match page.viewport().await {
            Ok(viewport) => ctx.viewport = Some(viewport),
            Err(e) => self.note_failure(incident, "viewport", e.to_string()),
        }
        match page.cookies().await {
            Ok(cookies) => {
                ctx.cookies = cookies
                    .into_iter()
                    .map(|meta| MaskedCookie {
                        meta,
                        value: MASK.to_string(),
                    })
                    .collect()
            }
            Err(e) => self.note_failure(incident, "cookies", e.to_string()),
        }
        for kind in [StorageKind::Local, StorageKind::Session] {
            match page.storage_keys(kind).await {
                Ok(keys) => {
                    let masked = keys.into_iter().map(|k| (k, MASK.to_string())).collect();
                    match kind {
                        StorageKind::Local => ctx.local_storage = masked,
                        StorageKind::Session => ctx.session_storage = masked,
                    }
                }
                Err(e) => {
                    let artifact = match kind {
                        StorageKind::Local => "local_storage",
                        StorageKind::Session => "session_storage",
                    };
                    self.note_failure(incident, artifact, e.to_string());
                }
            }
        }
        ctx
    }

    /// Delete the oldest incidents of this tenant until at most
    /// `max_incidents` remain. Returns the evicted ids.
    pub async fn enforce_retention(&self) -> Vec<String> {
        let dir = self.tenant_dir.clone();
        let max = self.max_incidents;
        let evicted = match tokio::task::spawn_blocking(move || prune(&dir, max)).await {
            Ok(evicted) => evicted,
            Err(e) => {
                tracing::warn!(error = %e, "forensics.retention.failed");
                return Vec::new();
            }
        };
        if !evicted.is_empty() {
            self.evicted
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            self.recent.lock().retain(|i| !evicted.contains(&i.id));
            tracing::info!(tenant = %self.tenant, evicted = evicted.len(), "forensics.retention.evicted");
        }
        evicted
    }

    /// Most recent incidents, newest first.
    pub fn get_recent(&self, limit: usize) -> Vec<Incident> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Look `id` up in memory, then scan every tenant partition under the root.
    pub async fn get_by_id(&self, id: &str) -> Option<Incident> {
        let cached = self.recent.lock().iter().find(|i| i.id == id).cloned();
        if cached.is_some() {
            return cached;
        }
        Some(self.load_document(id).await?.incident)
    }

    async fn load_document(&self, id: &str) -> Option<ContextDocument> {
        let root = self.root.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || read_document(&find_document(&root, &id)?))
            .await
            .ok()
            .flatten()
    }

    /// Re-hash the stored screenshot and DOM against the digests in the record.
    pub async fn verify(&self, id: &str) -> Option<IntegrityReport> {
        let incident = self.load_document(id).await?.incident;
        async fn check(artifact: &Option<ArtifactRef>) -> Option<bool> {
            let artifact = artifact.as_ref()?;
            Some(match tokio::fs::read(&artifact.path).await {
                Ok(bytes) => digest(&bytes) == artifact.blake3,
                Err(_) => false,
            })
        }
        Some(IntegrityReport {
            id: incident.id.clone(),
            screenshot_intact: check(&incident.captures.screenshot).await,
            dom_intact: check(&incident.captures.dom).await,
        })
    }

    pub fn status(&self) -> RecorderStatus {
        RecorderStatus {
            root: self.root.clone(),
            tenant: self.tenant.clone(),
            max_incidents: self.max_incidents,
            captured: self.captured.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            in_memory: self.recent.lock().len(),
        }
    }
}
