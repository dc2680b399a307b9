use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{Classify, ErrorCategory};
use crate::state::record::{FeatureRecord, StateDocument};

const DEFAULT_STATE_PATH: &str = ".cde/state.json";
const DEFAULT_MAX_BACKUPS: usize = 10;
const BACKUP_DIR_NAME: &str = "backups";
const BACKUP_PREFIX: &str = "state_";
const BACKUP_SUFFIX: &str = ".json";
const FEATURES_KEY: &str = "features";

/// Errors that can occur during state storage operations.
#[derive(Error, Debug)]
pub enum StateError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A feature record failed validation.
    #[error("Invalid state for feature '{feature}': {reason}")]
    Validation { feature: String, reason: String },

    /// A value outside one of the closed enumerations.
    #[error("Invalid {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },

    /// The document does not have the expected shape.
    #[error("Malformed state document: {0}")]
    Malformed(String),

    /// No feature with the given id.
    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    /// A feature with the given id is already recorded.
    #[error("Feature already exists: {0}")]
    FeatureExists(String),
}

/// Result type for state storage operations.
pub type StateResult<T> = Result<T, StateError>;

impl Classify for StateError {
    fn category(&self) -> ErrorCategory {
        match self {
            StateError::Io(err) => err.category(),
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Configuration for the persistent state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStoreConfig {
    /// Primary state file.
    /// Default: `.cde/state.json`
    pub path: PathBuf,

    /// Number of prior versions kept in the backup directory.
    /// Default: 10
    pub max_backups: usize,

    /// Backup directory. Defaults to `backups/` next to the state file.
    pub backup_dir: Option<PathBuf>,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STATE_PATH),
            max_backups: DEFAULT_MAX_BACKUPS,
            backup_dir: None,
        }
    }
}

impl StateStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// The directory backups are written to.
    pub fn resolved_backup_dir(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(BACKUP_DIR_NAME),
        }
    }
}

/// Result of a lenient load: the usable document plus anything that had to
/// be discarded to produce it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedState {
    pub document: StateDocument,
    pub diagnostics: Vec<String>,
}

impl LoadedState {
    fn empty_with(diagnostic: String) -> Self {
        Self {
            document: StateDocument::new(),
            diagnostics: vec![diagnostic],
        }
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// JSON state document on the local filesystem with atomic replacement and
/// rotating backups. Clones share one writer lock.
#[derive(Debug, Clone)]
pub struct PersistentStateStore {
    config: StateStoreConfig,
    backup_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl PersistentStateStore {
    pub fn new(config: StateStoreConfig) -> Self {
        let backup_dir = config.resolved_backup_dir();
        Self {
            config,
            backup_dir,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    /// Loads the document. A missing file is an empty document. An
    /// unreadable file, or entries that cannot be migrated to the current
    /// schema, produce diagnostics instead of an error.
    pub fn load(&self) -> LoadedState {
        let loaded = match self.read_raw() {
            Ok(None) => LoadedState::default(),
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => lenient_document(value),
                Err(err) => LoadedState::empty_with(format!(
                    "state file {} is not valid JSON: {err}",
                    self.path().display()
                )),
            },
            Err(err) => LoadedState::empty_with(format!(
                "state file {} could not be read: {err}",
                self.path().display()
            )),
        };

        for diagnostic in &loaded.diagnostics {
            error!(path = %self.path().display(), "{}", diagnostic);
        }
        debug!(
            path = %self.path().display(),
            features = loaded.document.features.len(),
            "state loaded"
        );
        loaded
    }

    /// Loads the document, failing on anything [`load`](Self::load) would
    /// have discarded.
    pub fn load_strict(&self) -> StateResult<StateDocument> {
        match self.read_raw()? {
            None => Ok(StateDocument::new()),
            Some(raw) => strict_document(serde_json::from_str(&raw)?),
        }
    }

    /// Validates and writes `document`, keeping the previous version as a
    /// backup. Returns the document as written, with timestamps stamped.
    pub fn save(&self, document: &StateDocument) -> StateResult<StateDocument> {
        let _guard = self.lock();
        self.write_locked(document, |_| Ok(()))
    }

    /// Validates a raw JSON document before anything touches disk, then
    /// saves it.
    pub fn save_value(&self, value: Value) -> StateResult<StateDocument> {
        let document = strict_document(value)?;
        self.save(&document)
    }

    /// Read-modify-write under the writer lock.
    pub fn update<F>(&self, mutate: F) -> StateResult<StateDocument>
    where
        F: FnOnce(&mut StateDocument) -> StateResult<()>,
    {
        let _guard = self.lock();
        let mut document = self.load().document;
        mutate(&mut document)?;
        self.write_locked(&document, |_| Ok(()))
    }

    /// Adds a feature that must not exist yet. The check and the write
    /// happen under one hold of the writer lock.
    pub fn insert_feature(
        &self,
        id: &str,
        record: FeatureRecord,
    ) -> StateResult<StateDocument> {
        self.update(|document| {
            if document.feature(id).is_some() {
                return Err(StateError::FeatureExists(id.to_string()));
            }
            document.upsert(id, record);
            Ok(())
        })
    }

    /// Backup files, oldest first.
    pub fn list_backups(&self) -> StateResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StateError::Io(err)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if backup_sequence(&entry.file_name().to_string_lossy()).is_some() {
                backups.push(entry.path());
            }
        }
        backups.sort_by_cached_key(|path| {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            (backup_sequence(&name), name)
        });
        Ok(backups)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_raw(&self) -> StateResult<Option<String>> {
        match fs::read_to_string(self.path()) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StateError::Io(err)),
        }
    }

    /// Writes with the lock already held. `before_replace` runs after the
    /// backup and temp file exist but before the rename.
    pub(crate) fn write_locked<H>(
        &self,
        document: &StateDocument,
        before_replace: H,
    ) -> StateResult<StateDocument>
    where
        H: FnOnce(&Path) -> StateResult<()>,
    {
        document.validate()?;

        let previous = match self.read_raw() {
            Ok(Some(raw)) => serde_json::from_str::<Value>(&raw)
                .ok()
                .map(|value| lenient_document(value).document),
            _ => None,
        };

        let mut next = document.clone();
        stamp_timestamps(&mut next, previous.as_ref());
        let json = serde_json::to_string_pretty(&next)?;

        if self.path().exists() {
            self.backup_current()?;
        }

        if let Some(parent) = self.path().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.temp_path();
        let written = write_temp(&temp_path, json.as_bytes())
            .and_then(|()| before_replace(&temp_path))
            .and_then(|()| fs::rename(&temp_path, self.path()).map_err(StateError::from));
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            error!(path = %self.path().display(), error = %err, "state save failed");
            return Err(err);
        }

        log_changes(previous.as_ref(), &next);
        info!(
            path = %self.path().display(),
            features = next.features.len(),
            "state saved"
        );
        Ok(next)
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        self.path().with_file_name(format!("{}.tmp", file_name))
    }

    fn backup_current(&self) -> StateResult<()> {
        fs::create_dir_all(&self.backup_dir)?;

        let existing = self.list_backups()?;
        let sequence = existing
            .iter()
            .filter_map(|path| path.file_name())
            .filter_map(|name| backup_sequence(&name.to_string_lossy()))
            .max()
            .map_or(1, |max| max + 1);
        let name = format!(
            "{BACKUP_PREFIX}{sequence:06}_{}{BACKUP_SUFFIX}",
            Utc::now().format("%Y%m%dT%H%M%SZ")
        );
        let backup_path = self.backup_dir.join(name);
        fs::copy(self.path(), &backup_path)?;
        debug!(backup = %backup_path.display(), "state backed up");

        self.rotate_backups()
    }

    fn rotate_backups(&self) -> StateResult<()> {
        let backups = self.list_backups()?;
        let excess = backups.len().saturating_sub(self.config.max_backups);
        for old in backups.into_iter().take(excess) {
            fs::remove_file(&old)?;
            debug!(backup = %old.display(), "old backup removed");
        }
        Ok(())
    }
}

impl Default for PersistentStateStore {
    fn default() -> Self {
        Self::new(StateStoreConfig::default())
    }
}

fn write_temp(path: &Path, bytes: &[u8]) -> StateResult<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Parses the sequence number out of `state_<seq>_<timestamp>.json`.
fn backup_sequence(file_name: &str) -> Option<u64> {
    let rest = file_name
        .strip_prefix(BACKUP_PREFIX)?
        .strip_suffix(BACKUP_SUFFIX)?;
    let (sequence, _timestamp) = rest.split_once('_')?;
    sequence.parse().ok()
}

/// Keeps `created_at` from disk and refreshes `updated_at` for records whose
/// content changed.
fn stamp_timestamps(next: &mut StateDocument, previous: Option<&StateDocument>) {
    let now = Utc::now();
    for (id, record) in next.features.iter_mut() {
        match previous.and_then(|doc| doc.features.get(id)) {
            Some(prior) => {
                record.created_at = prior.created_at;
                if record.content_differs(prior) {
                    record.updated_at = Some(now);
                } else {
                    record.updated_at = prior.updated_at;
                }
            }
            None => record.updated_at = Some(now),
        }
    }
}

fn log_changes(previous: Option<&StateDocument>, next: &StateDocument) {
    let empty = StateDocument::new();
    let previous = previous.unwrap_or(&empty);

    for (id, record) in &next.features {
        let Some(prior) = previous.features.get(id) else {
            info!(feature = %id, status = %record.status, "feature created");
            continue;
        };
        if !record.content_differs(prior) {
            continue;
        }
        let mut changes = Vec::new();
        if prior.status != record.status {
            changes.push(format!("status: {} -> {}", prior.status, record.status));
        }
        if prior.current_phase != record.current_phase {
            changes.push(format!(
                "current_phase: {} -> {}",
                prior.current_phase, record.current_phase
            ));
        }
        if prior.branch != record.branch {
            changes.push(format!(
                "branch: {} -> {}",
                prior.branch.as_deref().unwrap_or("-"),
                record.branch.as_deref().unwrap_or("-")
            ));
        }
        let changes = if changes.is_empty() {
            "details".to_string()
        } else {
            changes.join(", ")
        };
        info!(feature = %id, changes = %changes, "feature updated");
    }

    for id in previous.features.keys() {
        if !next.features.contains_key(id) {
            info!(feature = %id, "feature removed");
        }
    }
}

fn split_top_level(value: Value) -> Result<(Option<Value>, Map<String, Value>), String> {
    match value {
        Value::Object(mut map) => {
            let features = map.remove(FEATURES_KEY);
            Ok((features, map))
        }
        other => Err(format!(
            "top level must be an object, found {}",
            json_kind(&other)
        )),
    }
}

fn lenient_document(value: Value) -> LoadedState {
    let (features, extra) = match split_top_level(value) {
        Ok(parts) => parts,
        Err(reason) => return LoadedState::empty_with(reason),
    };

    let mut loaded = LoadedState {
        document: StateDocument {
            features: Default::default(),
            extra: extra.into_iter().collect(),
        },
        diagnostics: Vec::new(),
    };

    match features {
        None | Some(Value::Null) => {}
        Some(Value::Object(entries)) => {
            for (id, entry) in entries {
                match FeatureRecord::from_loose_value(&id, &entry) {
                    Ok(record) => {
                        loaded.document.features.insert(id, record);
                    }
                    Err(err) => {
                        warn!(feature = %id, error = %err, "dropping invalid feature state");
                        loaded
                            .diagnostics
                            .push(format!("dropped feature '{id}': {err}"));
                    }
                }
            }
        }
        Some(other) => loaded.diagnostics.push(format!(
            "'features' must be an object, found {}; ignoring it",
            json_kind(&other)
        )),
    }

    loaded
}

fn strict_document(value: Value) -> StateResult<StateDocument> {
    let (features, extra) = split_top_level(value).map_err(StateError::Malformed)?;

    let mut document = StateDocument {
        features: Default::default(),
        extra: extra.into_iter().collect(),
    };
    match features {
        None | Some(Value::Null) => {}
        Some(Value::Object(entries)) => {
            for (id, entry) in entries {
                let record: FeatureRecord =
                    serde_json::from_value(entry).map_err(|err| StateError::Validation {
                        feature: id.clone(),
                        reason: err.to_string(),
                    })?;
                record.validate(&id)?;
                document.features.insert(id, record);
            }
        }
        Some(other) => {
            return Err(StateError::Malformed(format!(
                "'features' must be an object, found {}",
                json_kind(&other)
            )))
        }
    }
    Ok(document)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
