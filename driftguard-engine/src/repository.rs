//! Tenant-scoped selector definitions loaded from a YAML source.
//!
//! The in-memory set is an immutable [`SelectorSet`] behind an `Arc`; reload
//! and update build a new set and swap the pointer under a short write lock,
//! so readers see either the old set or the new one.
use crate::atomic::write_atomic;
use crate::learner::SelectorLearner;
use async_trait::async_trait;
use driftguard_common::{DriftError, Result, SelectorSourceSettings};
use driftguard_drivers::SemanticQuery;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorDefinition {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic: Option<SemanticQuery>,
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl SelectorDefinition {
    /// `[primary] + fallbacks`, in source order.
    pub fn candidates(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.fallbacks.iter().cloned())
            .collect()
    }

    /// Move `selector` to the front of the fallbacks. Returns false when
    /// nothing changes (already the primary or already the first fallback).
    fn front_insert(&mut self, selector: &str) -> bool {
        if self.primary == selector || self.fallbacks.first().map(String::as_str) == Some(selector)
        {
            return false;
        }
        self.fallbacks.retain(|f| f != selector);
        self.fallbacks.insert(0, selector.to_string());
        true
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefinition {
    primary: String,
    #[serde(default)]
    fallbacks: Vec<String>,
    #[serde(default)]
    semantic: Option<SemanticQuery>,
}

/// Parsed selector source: scope -> path -> definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectorSet {
    scopes: BTreeMap<String, BTreeMap<String, SelectorDefinition>>,
}

impl SelectorSet {
    /// Parse and validate a selector document.
    ///
    /// ```
    /// use driftguard_engine::repository::SelectorSet;
    ///
    /// let set = SelectorSet::parse(r##"
    /// default:
    ///   login:
    ///     email: { primary: "#email", fallbacks: ["input[type=email]"] }
    /// es:
    ///   login.submit: { primary: "button[type=submit]" }
    /// "##).unwrap();
    /// assert_eq!(set.definition_count(), 2);
    /// assert!(set.lookup("es", "default", "login.email").is_some());
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(text).map_err(|e| invalid(format!("yaml: {e}")))?;
        let root = match doc {
            Value::Null => return Err(invalid("selector source is empty")),
            Value::Mapping(m) => m,
            other => {
                return Err(invalid(format!(
                    "selector source root must be a mapping, found {}",
                    kind_of(&other)
                )))
            }
        };

        let mut scopes = BTreeMap::new();
        for (key, value) in &root {
            let scope = key
                .as_str()
                .ok_or_else(|| invalid("tenant keys must be strings"))?;
            let body = value
                .as_mapping()
                .ok_or_else(|| invalid(format!("tenant `{scope}` must be a mapping")))?;
            let mut defs = BTreeMap::new();
            collect_definitions("", body, &mut defs)
                .map_err(|e| invalid(format!("tenant `{scope}`: {e}")))?;
            scopes.insert(scope.to_string(), defs);
        }

        let set = Self { scopes };
        if set.definition_count() == 0 {
            return Err(invalid("selector source defines no selectors"));
        }
        Ok(set)
    }

    /// Find `path` in `tenant`, then in `default_scope`. Returns the owning scope.
    pub fn lookup(
        &self,
        tenant: &str,
        default_scope: &str,
        path: &str,
    ) -> Option<(&str, &SelectorDefinition)> {
        [tenant, default_scope].into_iter().find_map(|scope| {
            let (name, defs) = self.scopes.get_key_value(scope)?;
            defs.get(path).map(|d| (name.as_str(), d))
        })
    }

    pub fn definition_count(&self) -> usize {
        self.scopes.values().map(BTreeMap::len).sum()
    }

    pub fn tenants(&self) -> Vec<String> {
        self.scopes.keys().cloned().collect()
    }

    /// Every path visible to `tenant`, including those inherited from the default scope.
    pub fn visible_paths(&self, tenant: &str, default_scope: &str) -> BTreeSet<String> {
        [tenant, default_scope]
            .into_iter()
            .filter_map(|scope| self.scopes.get(scope))
            .flat_map(|defs| defs.keys().cloned())
            .collect()
    }

    fn definition_mut(&mut self, scope: &str, path: &str) -> Option<&mut SelectorDefinition> {
        self.scopes.get_mut(scope)?.get_mut(path)
    }
}

fn invalid(msg: impl Into<String>) -> DriftError {
    DriftError::ConfigurationInvalid(msg.into())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn collect_definitions(
    prefix: &str,
    mapping: &Mapping,
    out: &mut BTreeMap<String, SelectorDefinition>,
) -> std::result::Result<(), String> {
    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| format!("non-string key under `{prefix}`"))?;
        let path = join_path(prefix, key);
        let Some(inner) = value.as_mapping() else {
            return Err(format!("`{path}` must be a mapping, found {}", kind_of(value)));
        };

        if !inner.contains_key("primary") {
            collect_definitions(&path, inner, out)?;
            continue;
        }

        let raw: RawDefinition =
            serde_yaml::from_value(value.clone()).map_err(|e| format!("`{path}`: {e}"))?;
        let primary = raw.primary.trim().to_string();
        if primary.is_empty() {
            return Err(format!("`{path}`: primary must not be empty"));
        }
        let semantic = raw.semantic.filter(|q| !q.is_empty());
        let definition = SelectorDefinition {
            path: path.clone(),
            semantic,
            primary,
            fallbacks: raw
                .fallbacks
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        };
        if out.insert(path.clone(), definition).is_some() {
            return Err(format!("`{path}` is defined twice"));
        }
    }
    Ok(())
}

/// Keys leading from a scope mapping to the definition for `path`, honouring
/// both nested and dotted spellings.
fn find_route(mapping: &Mapping, path: &str) -> Option<Vec<String>> {
    for (key, value) in mapping {
        let (Some(key), Some(inner)) = (key.as_str(), value.as_mapping()) else {
            continue;
        };
        let is_leaf = inner.contains_key("primary");
        if key == path && is_leaf {
            return Some(vec![key.to_string()]);
        }
        if is_leaf {
            continue;
        }
        if let Some(rest) = path.strip_prefix(key).and_then(|r| r.strip_prefix('.')) {
            if let Some(mut route) = find_route(inner, rest) {
                route.insert(0, key.to_string());
                return Some(route);
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReloadOutcome {
    /// The source parsed to the set already in memory.
    Unchanged,
    Applied { generation: u64, definitions: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStatus {
    pub source: PathBuf,
    pub tenant: String,
    pub default_scope: String,
    pub definitions: usize,
    pub tenants: Vec<String>,
    pub generation: u64,
    pub rejected_reloads: u64,
    pub last_error: Option<String>,
}

/// What the resolution pipeline needs from a selector source.
#[async_trait]
pub trait SelectorStore: Send + Sync {
    /// Primary selector for `path`.
    fn get(&self, path: &str) -> Option<String>;
    /// `[primary] + fallbacks`, empty when the path is unknown.
    fn get_with_fallback(&self, path: &str) -> Vec<String>;
    fn get_semantic(&self, path: &str) -> Option<SemanticQuery>;
    /// Re-read the source. A malformed source is rejected and the current set kept.
    async fn reload(&self) -> Result<ReloadOutcome>;
    /// Front-insert `selector` as a fallback of `path`, effective immediately
    /// and written back to the source. Returns whether anything changed.
    async fn update(&self, path: &str, selector: &str) -> Result<bool>;
    fn learner(&self) -> &SelectorLearner;
    fn source_path(&self) -> &Path;
}

/// File-backed [`SelectorStore`] for one tenant.
pub struct SelectorRepository {
    source: PathBuf,
    tenant: String,
    default_scope: String,
    current: RwLock<Arc<SelectorSet>>,
    // serialises reload and write-back so a reload never reads our own half-applied edit
    io_lock: tokio::sync::Mutex<()>,
    learner: SelectorLearner,
    generation: AtomicU64,
    rejected_reloads: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SelectorRepository {
    /// Load the source named in `settings`. Unlike a reload, a bad source here is an error.
    pub async fn open(settings: &SelectorSourceSettings, tenant: &str) -> Result<Self> {
        let set = read_source(&settings.path).await?;
        tracing::info!(
            source = %settings.path.display(),
            %tenant,
            definitions = set.definition_count(),
            "repository.loaded"
        );
        Ok(Self {
            source: settings.path.clone(),
            tenant: tenant.to_string(),
            default_scope: settings.default_scope.clone(),
            current: RwLock::new(Arc::new(set)),
            io_lock: tokio::sync::Mutex::new(()),
            learner: SelectorLearner::new(),
            generation: AtomicU64::new(1),
            rejected_reloads: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The set currently served to readers.
    pub fn snapshot(&self) -> Arc<SelectorSet> {
        self.current.read().clone()
    }

    pub fn definition(&self, path: &str) -> Option<SelectorDefinition> {
        let set = self.snapshot();
        set.lookup(&self.tenant, &self.default_scope, path)
            .map(|(_, d)| d.clone())
    }

    pub fn definition_count(&self) -> usize {
        self.snapshot().definition_count()
    }

    pub fn tenants(&self) -> Vec<String> {
        self.snapshot().tenants()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn rejected_reloads(&self) -> u64 {
        self.rejected_reloads.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> RepositoryStatus {
        let set = self.snapshot();
        RepositoryStatus {
            source: self.source.clone(),
            tenant: self.tenant.clone(),
            default_scope: self.default_scope.clone(),
            definitions: set.definition_count(),
            tenants: set.tenants(),
            generation: self.generation(),
            rejected_reloads: self.rejected_reloads(),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Paths whose candidate list differs between two sets, as seen by this tenant.
    fn changed_paths(&self, old: &SelectorSet, new: &SelectorSet) -> Vec<String> {
        let mut paths = old.visible_paths(&self.tenant, &self.default_scope);
        paths.extend(new.visible_paths(&self.tenant, &self.default_scope));
        paths
            .into_iter()
            .filter(|path| {
                let before = old.lookup(&self.tenant, &self.default_scope, path);
                let after = new.lookup(&self.tenant, &self.default_scope, path);
                before.map(|(_, d)| d.candidates()) != after.map(|(_, d)| d.candidates())
            })
            .collect()
    }

    async fn write_back(&self, scope: &str, path: &str, selector: &str) -> Result<()> {
        let text = tokio::fs::read_to_string(&self.source).await?;
        let mut doc: Value =
            serde_yaml::from_str(&text).map_err(|e| invalid(format!("yaml: {e}")))?;
        let scope_map = doc
            .as_mapping_mut()
            .and_then(|root| root.get_mut(scope))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| invalid(format!("scope `{scope}` missing from source")))?;
        let route = find_route(scope_map, path)
            .ok_or_else(|| invalid(format!("`{path}` missing from scope `{scope}`")))?;

        let mut definition = scope_map;
        for key in &route {
            definition = definition
                .get_mut(key.as_str())
                .and_then(Value::as_mapping_mut)
                .ok_or_else(|| invalid(format!("`{path}` changed shape during write-back")))?;
        }

        let mut fallbacks = match definition.get("fallbacks") {
            Some(Value::Sequence(seq)) => seq.clone(),
            _ => Vec::new(),
        };
        fallbacks.retain(|v| v.as_str() != Some(selector));
        fallbacks.insert(0, Value::String(selector.to_string()));
        definition.insert(Value::from("fallbacks"), Value::Sequence(fallbacks));

        let rendered = serde_yaml::to_string(&doc).map_err(|e| invalid(format!("yaml: {e}")))?;
        write_atomic(&self.source, rendered.into_bytes()).await?;
        Ok(())
    }
}

async fn read_source(path: &Path) -> Result<SelectorSet> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
    SelectorSet::parse(&text)
}

#[async_trait]
impl SelectorStore for SelectorRepository {
    fn get(&self, path: &str) -> Option<String> {
        self.definition(path).map(|d| d.primary)
    }

    fn get_with_fallback(&self, path: &str) -> Vec<String> {
        self.definition(path)
            .map(|d| d.candidates())
            .unwrap_or_default()
    }

    fn get_semantic(&self, path: &str) -> Option<SemanticQuery> {
        self.definition(path).and_then(|d| d.semantic)
    }

    async fn reload(&self) -> Result<ReloadOutcome> {
        let _io = self.io_lock.lock().await;
        let parsed = match read_source(&self.source).await {
            Ok(set) => set,
            Err(e) => {
                self.rejected_reloads.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e.to_string());
                tracing::warn!(
                    source = %self.source.display(),
                    error = %e,
                    "repository.reload.rejected"
                );
                return Err(e);
            }
        };
        *self.last_error.lock() = None;

        let previous = self.snapshot();
        if *previous == parsed {
            tracing::debug!(source = %self.source.display(), "repository.reload.unchanged");
            return Ok(ReloadOutcome::Unchanged);
        }

        for path in self.changed_paths(&previous, &parsed) {
            self.learner.reset(&path);
        }
        let definitions = parsed.definition_count();
        *self.current.write() = Arc::new(parsed);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            source = %self.source.display(),
            definitions,
            generation,
            "repository.reload.applied"
        );
        Ok(ReloadOutcome::Applied {
            generation,
            definitions,
        })
    }

    async fn update(&self, path: &str, selector: &str) -> Result<bool> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(invalid("cannot persist an empty selector"));
        }
        let _io = self.io_lock.lock().await;

        let scope = {
            let mut current = self.current.write();
            let scope = match current.lookup(&self.tenant, &self.default_scope, path) {
                Some((scope, _)) => scope.to_string(),
                None => return Err(invalid(format!("unknown selector path `{path}`"))),
            };
            let mut next = (**current).clone();
            let changed = next
                .definition_mut(&scope, path)
                .map(|d| d.front_insert(selector))
                .unwrap_or(false);
            if !changed {
                return Ok(false);
            }
            *current = Arc::new(next);
            scope
        };

        self.learner.reset(path);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(%path, %scope, %selector, generation, "repository.update.applied");

        if let Err(e) = self.write_back(&scope, path, selector).await {
            tracing::warn!(%path, error = %e, "repository.update.write_back_failed");
            return Err(e);
        }
        Ok(true)
    }

    fn learner(&self) -> &SelectorLearner {
        &self.learner
    }

    fn source_path(&self) -> &Path {
        &self.source
    }
}
