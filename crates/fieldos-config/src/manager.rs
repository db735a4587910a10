//! [`ConfigManager`] – versioned, validated, hot-reloadable configuration.
//!
//! # Layout
//!
//! | File | Role |
//! |---|---|
//! | `<dir>/<ns>.toml` | base document of namespace `ns` |
//! | `<dir>/<ns>.<env>.toml` | overlay for environment `env` (`FIELDOS_ENV`), deep-merged over the base |
//! | `<dir>/.backups/<ns>.v<N>.toml` | the last few superseded versions |
//!
//! # Reload pipeline
//!
//! 1. Read and merge base and overlay.  Identical content is a no-op.
//! 2. Parse and run the namespace validator.
//! 3. Invalid: keep serving the current version and raise one
//!    `config_rejected` alert for this content.
//! 4. Valid: back up the current version, swap the new one in and notify
//!    every registered callback.
//!
//! Readers only ever get a complete [`ConfigurationDocument`] behind an
//! `Arc`, so nobody observes a half-applied change.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldos_types::{Alert, AlertKind, Severity};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::schema::{FieldOsConfig, MAIN_NAMESPACE, apply_env_overrides};

/// Default rollback depth.
pub const DEFAULT_HISTORY_DEPTH: usize = 5;

const BACKUP_DIR: &str = ".backups";

/// One version of one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationDocument {
    pub namespace: String,
    /// Starts at 1 and grows with every applied change, including restores.
    pub version: u64,
    pub sections: toml::Table,
    pub checksum: String,
    pub loaded_at: DateTime<Utc>,
    pub source_path: PathBuf,
}

impl ConfigurationDocument {
    /// Deserialize the whole document into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        toml::Value::Table(self.sections.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: self.source_path.clone(),
                message: e.to_string(),
            })
    }

    pub fn section(&self, name: &str) -> Option<&toml::Value> {
        self.sections.get(name)
    }
}

/// Result of a reload attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    /// Content identical to what was last read.
    Unchanged,
    Applied { version: u64 },
    /// Invalid content; the previous version stays in force.
    Rejected { reason: String },
}

pub type ChangeCallback = Arc<dyn Fn(&ConfigurationDocument) + Send + Sync>;
pub type Validator = Arc<dyn Fn(&ConfigurationDocument) -> Result<(), String> + Send + Sync>;

struct NamespaceState {
    current: Arc<ConfigurationDocument>,
    history: VecDeque<Arc<ConfigurationDocument>>,
    /// Checksum of the file content last read, applied or not.
    disk_checksum: String,
}

pub struct ConfigManager {
    config_dir: PathBuf,
    environment: Option<String>,
    history_depth: usize,
    namespaces: RwLock<HashMap<String, NamespaceState>>,
    validators: RwLock<HashMap<String, Validator>>,
    callbacks: RwLock<HashMap<String, Vec<ChangeCallback>>>,
    alerts: broadcast::Sender<Alert>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl ConfigManager {
    /// A manager over `config_dir` with the main namespace's validator
    /// registered.
    pub fn new(config_dir: impl Into<PathBuf>, environment: Option<String>) -> Self {
        let (alerts, _) = broadcast::channel(64);
        let manager = Self {
            config_dir: config_dir.into(),
            environment: environment.filter(|e| !e.is_empty()),
            history_depth: DEFAULT_HISTORY_DEPTH,
            namespaces: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            alerts,
        };
        manager.register_validator(MAIN_NAMESPACE, |doc: &ConfigurationDocument| {
            let cfg: FieldOsConfig = doc.parse().map_err(|e| e.to_string())?;
            cfg.validate().map_err(|e| e.to_string())
        });
        manager
    }

    /// Like [`new`](Self::new), taking the environment from `FIELDOS_ENV`.
    pub fn from_env(config_dir: impl Into<PathBuf>) -> Self {
        Self::new(config_dir, std::env::var("FIELDOS_ENV").ok())
    }

    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth.max(1);
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn register_validator<F>(&self, namespace: &str, validator: F)
    where
        F: Fn(&ConfigurationDocument) -> Result<(), String> + Send + Sync + 'static,
    {
        write(&self.validators).insert(namespace.to_string(), Arc::new(validator));
    }

    pub fn register_change_callback<F>(&self, namespace: &str, callback: F)
    where
        F: Fn(&ConfigurationDocument) + Send + Sync + 'static,
    {
        write(&self.callbacks)
            .entry(namespace.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Load every `<ns>.toml` in the config directory, plus the main
    /// namespace even if its file does not exist.  Returns the namespaces in
    /// name order.  Any invalid document fails the whole load.
    pub fn load_all(&self) -> Result<Vec<String>, ConfigError> {
        let mut names = vec![MAIN_NAMESPACE.to_string()];
        if self.config_dir.is_dir() {
            for entry in std::fs::read_dir(&self.config_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                // `<ns>.<env>.toml` overlays are not namespaces of their own.
                if !stem.contains('.') && !names.iter().any(|n| n == stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        for name in &names {
            self.load(name)?;
        }
        info!(namespaces = ?names, dir = %self.config_dir.display(), "configuration loaded");
        Ok(names)
    }

    /// Load (or re-load unconditionally) one namespace.
    pub fn load(&self, namespace: &str) -> Result<Arc<ConfigurationDocument>, ConfigError> {
        let (sections, checksum) = self.read_namespace(namespace)?;
        let version = read(&self.namespaces)
            .get(namespace)
            .map(|s| s.current.version + 1)
            .unwrap_or(1);
        let doc = self.document(namespace, version, sections, checksum.clone());
        self.validate(&doc).map_err(|reason| ConfigError::Invalid {
            namespace: namespace.to_string(),
            reason,
        })?;

        let doc = Arc::new(doc);
        let mut namespaces = write(&self.namespaces);
        match namespaces.get_mut(namespace) {
            Some(state) => {
                let previous = std::mem::replace(&mut state.current, Arc::clone(&doc));
                push_history(&mut state.history, previous, self.history_depth);
                state.disk_checksum = checksum;
            }
            None => {
                namespaces.insert(
                    namespace.to_string(),
                    NamespaceState {
                        current: Arc::clone(&doc),
                        history: VecDeque::new(),
                        disk_checksum: checksum,
                    },
                );
            }
        }
        Ok(doc)
    }

    fn read_namespace(&self, namespace: &str) -> Result<(toml::Table, String), ConfigError> {
        let base = self.base_path(namespace);
        let mut hasher = DefaultHasher::new();
        let mut sections = match std::fs::read_to_string(&base) {
            Ok(raw) => {
                raw.hash(&mut hasher);
                parse_table(&base, &raw)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if namespace != MAIN_NAMESPACE {
                    return Err(ConfigError::UnknownNamespace(namespace.to_string()));
                }
                toml::Table::new()
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(overlay_path) = self.overlay_path(namespace) {
            match std::fs::read_to_string(&overlay_path) {
                Ok(raw) => {
                    "overlay".hash(&mut hasher);
                    raw.hash(&mut hasher);
                    merge_tables(&mut sections, parse_table(&overlay_path, &raw)?);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok((sections, format!("{:016x}", hasher.finish())))
    }

    fn document(&self, namespace: &str, version: u64, sections: toml::Table, checksum: String) -> ConfigurationDocument {
        ConfigurationDocument {
            namespace: namespace.to_string(),
            version,
            sections,
            checksum,
            loaded_at: Utc::now(),
            source_path: self.base_path(namespace),
        }
    }

    fn validate(&self, doc: &ConfigurationDocument) -> Result<(), String> {
        let validator = read(&self.validators).get(&doc.namespace).cloned();
        match validator {
            Some(v) => v(doc),
            None => Ok(()),
        }
    }

    pub fn base_path(&self, namespace: &str) -> PathBuf {
        self.config_dir.join(format!("{namespace}.toml"))
    }

    pub fn overlay_path(&self, namespace: &str) -> Option<PathBuf> {
        self.environment
            .as_ref()
            .map(|env| self.config_dir.join(format!("{namespace}.{env}.toml")))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, namespace: &str) -> Option<Arc<ConfigurationDocument>> {
        read(&self.namespaces).get(namespace).map(|s| Arc::clone(&s.current))
    }

    /// Typed view of `namespace`.
    pub fn get_typed<T: DeserializeOwned>(&self, namespace: &str) -> Result<T, ConfigError> {
        self.get(namespace)
            .ok_or_else(|| ConfigError::UnknownNamespace(namespace.to_string()))?
            .parse()
    }

    /// The main namespace with `FIELDOS_*` environment overrides applied.
    pub fn fieldos_config(&self) -> Result<FieldOsConfig, ConfigError> {
        let mut cfg: FieldOsConfig = self.get_typed(MAIN_NAMESPACE)?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    /// Versions available to [`restore`](Self::restore), oldest first.
    pub fn history(&self, namespace: &str) -> Vec<u64> {
        read(&self.namespaces)
            .get(namespace)
            .map(|s| s.history.iter().map(|d| d.version).collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Changes
    // -----------------------------------------------------------------------

    /// Re-read `namespace` from disk and apply it if it changed and is valid.
    ///
    /// Only namespaces already loaded can be reloaded; use
    /// [`ConfigManager::load`] for a new one.
    pub fn reload(&self, namespace: &str) -> Result<ReloadOutcome, ConfigError> {
        let known = read(&self.namespaces).get(namespace).map(|s| s.disk_checksum.clone());
        let Some(seen) = known else {
            return Err(ConfigError::UnknownNamespace(namespace.to_string()));
        };

        let (sections, checksum) = match self.read_namespace(namespace) {
            Ok(read) => read,
            Err(e @ (ConfigError::Parse { .. } | ConfigError::UnknownNamespace(_))) => {
                // The unparsable text still counts as seen, so it alerts once.
                let fingerprint = format!("unreadable:{e}");
                return Ok(self.reject(namespace, fingerprint, e.to_string()));
            }
            Err(e) => return Err(e),
        };
        if checksum == seen {
            debug!(namespace, "configuration unchanged");
            return Ok(ReloadOutcome::Unchanged);
        }

        let version = self.get(namespace).map(|d| d.version + 1).unwrap_or(1);
        let doc = self.document(namespace, version, sections, checksum.clone());
        if let Err(reason) = self.validate(&doc) {
            return Ok(self.reject(namespace, checksum, reason));
        }
        self.install(namespace, Arc::new(doc), Some(checksum))
    }

    fn reject(&self, namespace: &str, checksum: String, reason: String) -> ReloadOutcome {
        let first_time = {
            let mut namespaces = write(&self.namespaces);
            match namespaces.get_mut(namespace) {
                Some(state) if state.disk_checksum != checksum => {
                    state.disk_checksum = checksum;
                    true
                }
                _ => false,
            }
        };
        if !first_time {
            return ReloadOutcome::Unchanged;
        }
        error!(namespace, %reason, "configuration rejected, keeping last good version");
        let alert = Alert::new(
            Severity::Warning,
            AlertKind::ConfigRejected,
            format!("config:{namespace}"),
            format!("configuration rejected: {reason}"),
        )
        .with_data(serde_json::json!({
            "namespace": namespace,
            "serving_version": self.get(namespace).map(|d| d.version),
        }));
        let _ = self.alerts.send(alert);
        ReloadOutcome::Rejected { reason }
    }

    /// Back up the current version, swap `doc` in and notify callbacks.
    fn install(
        &self,
        namespace: &str,
        doc: Arc<ConfigurationDocument>,
        disk_checksum: Option<String>,
    ) -> Result<ReloadOutcome, ConfigError> {
        let previous = {
            let mut namespaces = write(&self.namespaces);
            let state = namespaces
                .get_mut(namespace)
                .ok_or_else(|| ConfigError::UnknownNamespace(namespace.to_string()))?;
            let previous = std::mem::replace(&mut state.current, Arc::clone(&doc));
            push_history(&mut state.history, Arc::clone(&previous), self.history_depth);
            if let Some(checksum) = disk_checksum {
                state.disk_checksum = checksum;
            }
            previous
        };
        if let Err(e) = self.write_backup(&previous) {
            warn!(namespace, error = %e, "configuration backup failed");
        }
        info!(namespace, from = previous.version, to = doc.version, "configuration applied");

        let callbacks = read(&self.callbacks).get(namespace).cloned().unwrap_or_default();
        for callback in callbacks {
            callback(&doc);
        }
        Ok(ReloadOutcome::Applied { version: doc.version })
    }

    /// Re-apply the content of an earlier `version` as a new version.
    pub fn restore(&self, namespace: &str, version: u64) -> Result<Arc<ConfigurationDocument>, ConfigError> {
        let target = read(&self.namespaces)
            .get(namespace)
            .ok_or_else(|| ConfigError::UnknownNamespace(namespace.to_string()))?
            .history
            .iter()
            .find(|d| d.version == version)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownVersion {
                namespace: namespace.to_string(),
                version,
            })?;

        let next = self.get(namespace).map(|d| d.version + 1).unwrap_or(1);
        let mut doc = (*target).clone();
        doc.version = next;
        doc.loaded_at = Utc::now();
        let doc = Arc::new(doc);
        self.install(namespace, Arc::clone(&doc), None)?;
        info!(namespace, restored = version, as_version = next, "configuration restored");
        Ok(doc)
    }

    fn backup_dir(&self) -> PathBuf {
        self.config_dir.join(BACKUP_DIR)
    }

    fn write_backup(&self, doc: &ConfigurationDocument) -> Result<(), ConfigError> {
        let dir = self.backup_dir();
        std::fs::create_dir_all(&dir)?;
        let body = toml::to_string_pretty(&doc.sections).map_err(|e| ConfigError::Parse {
            path: doc.source_path.clone(),
            message: e.to_string(),
        })?;
        let path = dir.join(format!("{}.v{}.toml", doc.namespace, doc.version));
        std::fs::write(&path, body)?;

        let mut backups = self.backups(&doc.namespace)?;
        while backups.len() > self.history_depth {
            let (_, oldest) = backups.remove(0);
            std::fs::remove_file(&oldest)?;
        }
        Ok(())
    }

    /// Backup files of `namespace` as `(version, path)`, oldest first.
    pub fn backups(&self, namespace: &str) -> Result<Vec<(u64, PathBuf)>, ConfigError> {
        let dir = self.backup_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{namespace}.v");
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let version = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|n| n.strip_suffix(".toml"))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(v) = version {
                found.push((v, path));
            }
        }
        found.sort();
        Ok(found)
    }

    // -----------------------------------------------------------------------
    // Hot reload
    // -----------------------------------------------------------------------

    /// Watch the files of `namespace` and reload after `debounce` of quiet.
    pub fn start_hot_reload(self: &Arc<Self>, namespace: &str, debounce: Duration) -> Result<HotReload, ConfigError> {
        if self.get(namespace).is_none() {
            return Err(ConfigError::UnknownNamespace(namespace.to_string()));
        }
        let mut names = vec![format!("{namespace}.toml")];
        if let Some(env) = &self.environment {
            names.push(format!("{namespace}.{env}.toml"));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && event.paths.iter().any(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| names.iter().any(|w| w == n))
                });
                if relevant {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "configuration watch error"),
        })?;
        watcher.watch(&self.config_dir, RecursiveMode::NonRecursive)?;

        let manager = Arc::clone(self);
        let ns = namespace.to_string();
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Editors write in bursts; wait for the directory to settle.
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                match manager.reload(&ns) {
                    Ok(outcome) => debug!(namespace = %ns, ?outcome, "hot reload"),
                    Err(e) => error!(namespace = %ns, error = %e, "hot reload failed"),
                }
            }
        });
        info!(namespace, dir = %self.config_dir.display(), "hot reload enabled");
        Ok(HotReload {
            _watcher: watcher,
            task,
        })
    }
}

/// Keeps a namespace under watch; dropping it stops watching.
pub struct HotReload {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for HotReload {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn push_history(history: &mut VecDeque<Arc<ConfigurationDocument>>, doc: Arc<ConfigurationDocument>, depth: usize) {
    history.push_back(doc);
    while history.len() > depth {
        history.pop_front();
    }
}

fn parse_table(path: &Path, raw: &str) -> Result<toml::Table, ConfigError> {
    raw.parse::<toml::Table>().map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deep-merge `overlay` into `base`: tables merge, everything else replaces.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
