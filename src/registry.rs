//! Model Registry Module
//!
//! Provides the hot-reloadable mapping of model names to backend descriptors:
//! - Parsing and strict validation of the YAML model config
//! - Immutable snapshots swapped atomically on reload
//! - Cheap mtime-based reload checks for the request path
//! - Environment seeding with set-if-absent semantics
//!
//! Config source format:
//!
//! ```yaml
//! models:
//!   qwen-7b:
//!     backend_url: http://vllm:8000
//!     backend: vllm          # vllm | llamacpp (default: vllm)
//!     embeddings: false
//!     headers:
//!       x-tenant: research
//!     env:
//!       HF_TOKEN: hf_xxx
//!     limits:
//!       max_connections: 32
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use crate::error::{GatewayError, Result};

/// Wire-compatibility tag of a backend. Informational only: every kind
/// speaks the OpenAI-style JSON API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Vllm,
    Llamacpp,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Vllm => "vllm",
            BackendKind::Llamacpp => "llamacpp",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model entry exactly as written in the config source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    #[serde(alias = "service_url")]
    pub backend_url: String,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub embeddings: bool,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Signed so that non-positive values get a descriptive validation error
    /// instead of a generic type mismatch.
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
}

/// Top-level layout of the config source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsFile {
    #[serde(default)]
    pub models: Option<BTreeMap<String, ModelEntry>>,
}

impl ModelsFile {
    /// Parse YAML (or JSON) text. An empty document is an empty registry.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| GatewayError::ConfigInvalid(e.to_string()))
    }

    /// Validate every entry. Fails on the first invalid entry; nothing is
    /// returned unless all of them pass.
    pub fn into_descriptors(self) -> Result<BTreeMap<String, Arc<ModelDescriptor>>> {
        let mut out = BTreeMap::new();
        for (name, entry) in self.models.unwrap_or_default() {
            let descriptor = entry
                .into_descriptor(&name)
                .map_err(|msg| GatewayError::ConfigInvalid(format!("model '{name}': {msg}")))?;
            out.insert(name, Arc::new(descriptor));
        }
        Ok(out)
    }
}

/// Validated record describing one backend model and how to reach it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    /// Absolute http(s) URL without a trailing slash.
    pub backend_url: String,
    pub backend_kind: BackendKind,
    pub supports_embeddings: bool,
    pub extra_headers: BTreeMap<String, String>,
    pub env_overrides: BTreeMap<String, String>,
    /// Advisory only; carried on the descriptor but not enforced.
    pub limits: BTreeMap<String, u64>,
}

impl ModelDescriptor {
    /// Join the backend base URL and an API path (`/v1/...`).
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.backend_url, path.trim_start_matches('/'))
    }
}

impl ModelEntry {
    fn into_descriptor(self, name: &str) -> std::result::Result<ModelDescriptor, String> {
        if name.trim().is_empty() {
            return Err("model name must not be empty".into());
        }

        let url = reqwest::Url::parse(self.backend_url.trim())
            .map_err(|e| format!("invalid backend_url '{}': {e}", self.backend_url))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(format!(
                "backend_url '{}' must be an absolute http(s) URL",
                self.backend_url
            ));
        }

        for (key, value) in &self.headers {
            http::HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| format!("invalid header name '{key}'"))?;
            http::HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header '{key}'"))?;
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(format!("invalid environment variable name '{key}'"));
            }
            if value.contains('\0') {
                return Err(format!("environment variable '{key}' contains a NUL byte"));
            }
        }

        let mut limits = BTreeMap::new();
        for (key, value) in self.limits {
            if value <= 0 {
                return Err(format!("limit '{key}' must be a positive integer, got {value}"));
            }
            limits.insert(key, value as u64);
        }

        Ok(ModelDescriptor {
            name: name.to_string(),
            backend_url: url.as_str().trim_end_matches('/').to_string(),
            backend_kind: self.backend,
            supports_embeddings: self.embeddings,
            extra_headers: self.headers,
            env_overrides: self.env,
            limits,
        })
    }
}

/// Process-wide key/value store used for environment seeding.
pub trait EnvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
    }

    fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

/// Apply every descriptor's `env_overrides`, skipping keys that already
/// exist. Returns the keys that were actually written.
pub fn seed_env<'a>(
    store: &dyn EnvStore,
    descriptors: impl IntoIterator<Item = &'a ModelDescriptor>,
) -> Vec<String> {
    let mut applied = Vec::new();
    for descriptor in descriptors {
        for (key, value) in &descriptor.env_overrides {
            if store.get(key).is_some() {
                tracing::debug!(model = %descriptor.name, key = %key, "env already set; skipping");
                continue;
            }
            store.set(key, value);
            applied.push(key.clone());
        }
    }
    applied
}

/// Immutable, fully validated registry state.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    models: BTreeMap<String, Arc<ModelDescriptor>>,
    source_mtime: Option<SystemTime>,
    generation: u64,
}

impl RegistrySnapshot {
    pub fn new(
        models: BTreeMap<String, Arc<ModelDescriptor>>,
        source_mtime: Option<SystemTime>,
        generation: u64,
    ) -> Self {
        Self {
            models,
            source_mtime,
            generation,
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotFound {
                requested: name.to_string(),
                known: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn source_mtime(&self) -> Option<SystemTime> {
        self.source_mtime
    }

    /// Monotonic counter bumped on every successful load.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> RegistryStats {
        let mut backends = BTreeMap::new();
        for descriptor in self.models.values() {
            *backends
                .entry(descriptor.backend_kind.as_str().to_string())
                .or_insert(0) += 1;
        }
        RegistryStats {
            total_models: self.models.len(),
            embedding_models: self
                .models
                .values()
                .filter(|d| d.supports_embeddings)
                .count(),
            backends,
            generation: self.generation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_models: usize,
    pub embedding_models: usize,
    pub backends: BTreeMap<String, usize>,
    pub generation: u64,
}

/// Hot-reloading model registry backed by a config file.
pub struct Registry {
    path: PathBuf,
    current: RwLock<Arc<RegistrySnapshot>>,
    reload_lock: Mutex<()>,
    /// Mtime of the last source version that failed validation.
    rejected_mtime: Mutex<Option<SystemTime>>,
    env: Arc<dyn EnvStore>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.path)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Load the config at `path`, seeding the real process environment.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_env(path, Arc::new(ProcessEnv))
    }

    /// Load the config at `path`, seeding `env` instead of the process environment.
    pub fn open_with_env<P: AsRef<Path>>(path: P, env: Arc<dyn EnvStore>) -> Result<Self> {
        let registry = Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            reload_lock: Mutex::new(()),
            rejected_mtime: Mutex::new(None),
            env,
        };
        registry.load()?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The active snapshot. Callers keep using it even if a reload lands later.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read, validate and install the config source. On any failure the
    /// active snapshot is left untouched and the error is returned.
    pub fn load(&self) -> Result<Arc<RegistrySnapshot>> {
        let _serialized = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.load_locked()
    }

    /// Reload only when the source exists and its mtime is strictly newer
    /// than the active snapshot's. A version that was already rejected is
    /// not parsed again until the file changes. Returns whether a reload
    /// happened.
    pub fn maybe_reload(&self) -> Result<bool> {
        let Some(mtime) = source_mtime(&self.path) else {
            return Ok(false);
        };
        if !is_newer(Some(mtime), self.snapshot().source_mtime()) || self.was_rejected(mtime) {
            return Ok(false);
        }

        let _serialized = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Another caller may have reloaded (or rejected) while we waited.
        let Some(mtime) = source_mtime(&self.path) else {
            return Ok(false);
        };
        if !is_newer(Some(mtime), self.snapshot().source_mtime()) || self.was_rejected(mtime) {
            return Ok(false);
        }
        self.load_locked().map(|_| true)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        self.snapshot().resolve(name)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    fn was_rejected(&self, mtime: SystemTime) -> bool {
        *self
            .rejected_mtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(mtime)
    }

    fn set_rejected(&self, mtime: Option<SystemTime>) {
        *self
            .rejected_mtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = mtime;
    }

    fn load_locked(&self) -> Result<Arc<RegistrySnapshot>> {
        // Stat before reading so a write racing the read is picked up by the next check.
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| {
                GatewayError::ConfigInvalid(format!("cannot stat {}: {e}", self.path.display()))
            })?;
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            GatewayError::ConfigInvalid(format!("cannot read {}: {e}", self.path.display()))
        })?;

        let models = match ModelsFile::parse(&text).and_then(ModelsFile::into_descriptors) {
            Ok(models) => models,
            Err(err) => {
                tracing::error!(path = %self.path.display(), error = %err, "model config rejected");
                self.set_rejected(Some(mtime));
                return Err(err);
            }
        };
        self.set_rejected(None);

        let applied = seed_env(self.env.as_ref(), models.values().map(|d| d.as_ref()));
        if !applied.is_empty() {
            tracing::info!(keys = ?applied, "seeded environment from model config");
        }

        let generation = self.snapshot().generation() + 1;
        let snapshot = Arc::new(RegistrySnapshot::new(models, Some(mtime), generation));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();

        tracing::info!(
            path = %self.path.display(),
            models = snapshot.len(),
            generation,
            "model registry loaded"
        );
        Ok(snapshot)
    }
}

fn source_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn is_newer(candidate: Option<SystemTime>, recorded: Option<SystemTime>) -> bool {
    match (candidate, recorded) {
        (Some(c), Some(r)) => c > r,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
