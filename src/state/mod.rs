//! Durable build state.
//!
//! One JSON file per build id under the state directory. Every write goes to
//! a temporary sibling and is renamed into place, so a reader (including a
//! resumed process after a crash) sees either the previous record or the new
//! one, never a torn file.
//!
//! The record is strongly typed and versioned. Loads that do not match the
//! schema, disagree with their file name, or carry an inconsistent
//! `current_step` fail closed with [`StateError::Corrupt`].

mod lock;

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::build_id::is_valid_build_id;

pub use lock::BuildLock;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

const RECORD_EXTENSION: &str = "json";
const LOCKS_SUBDIR: &str = "locks";

/// One unit of the fixed build sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    Bootstrap,
    Packages,
    CustomCommands,
    Environment,
    PackageArtifact,
}

impl BuildStep {
    /// Steps in execution order.
    pub const ALL: [BuildStep; 5] = [
        BuildStep::Bootstrap,
        BuildStep::Packages,
        BuildStep::CustomCommands,
        BuildStep::Environment,
        BuildStep::PackageArtifact,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn at(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStep::Bootstrap => "bootstrap",
            BuildStep::Packages => "packages",
            BuildStep::CustomCommands => "custom_commands",
            BuildStep::Environment => "environment",
            BuildStep::PackageArtifact => "package_artifact",
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown build step '{s}'"))
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("build state '{0}' not found")]
    NotFound(String),
    #[error("build state '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid build id '{0}'")]
    InvalidId(String),
    #[error("build state '{build_id}' is corrupt: {reason}")]
    Corrupt { build_id: String, reason: String },
    #[error("build state '{build_id}' has schema version {found}, expected {expected}")]
    UnsupportedVersion {
        build_id: String,
        found: u64,
        expected: u32,
    },
    #[error("build '{0}' is already running in another process")]
    Locked(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("serializing build state '{build_id}': {source}")]
    Serialize {
        build_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable progress of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildRecord {
    pub schema_version: u32,
    pub build_id: String,
    pub config_name: String,
    pub started_at: String,
    current_step: usize,
    completed_steps: Vec<BuildStep>,
    pub failed_step: Option<BuildStep>,
    pub error_message: Option<String>,
    #[serde(rename = "temp_dir")]
    pub work_dir: Option<PathBuf>,
    pub rootfs_path: Option<PathBuf>,
}

impl BuildRecord {
    fn new(build_id: &str, config_name: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            build_id: build_id.to_string(),
            config_name: config_name.to_string(),
            started_at: now_utc_compact(),
            current_step: 0,
            completed_steps: Vec::new(),
            failed_step: None,
            error_message: None,
            work_dir: None,
            rootfs_path: None,
        }
    }

    /// Index of the next step to run; `BuildStep::ALL.len()` once finished.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn completed_steps(&self) -> &[BuildStep] {
        &self.completed_steps
    }

    pub fn is_completed(&self, step: BuildStep) -> bool {
        self.completed_steps.contains(&step)
    }

    pub fn next_step(&self) -> Option<BuildStep> {
        BuildStep::at(self.current_step)
    }

    pub fn is_finished(&self) -> bool {
        self.next_step().is_none()
    }

    /// Add `step` to the completed set. Returns false if it was already there.
    fn insert_completed(&mut self, step: BuildStep) -> bool {
        if self.is_completed(step) {
            return false;
        }
        self.completed_steps.push(step);
        self.completed_steps.sort();
        self.current_step = derived_step_index(&self.completed_steps);
        true
    }

    fn check(&self, expected_id: &str) -> Result<(), String> {
        if self.build_id != expected_id {
            return Err(format!(
                "record names build '{}' but is stored as '{}'",
                self.build_id, expected_id
            ));
        }
        let mut seen = self.completed_steps.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.completed_steps.len() {
            return Err("completed_steps contains duplicates".to_string());
        }
        let derived = derived_step_index(&self.completed_steps);
        if self.current_step != derived {
            return Err(format!(
                "current_step is {} but completed_steps imply {}",
                self.current_step, derived
            ));
        }
        if self.work_dir.is_some() != self.rootfs_path.is_some() {
            return Err("temp_dir and rootfs_path must be set together".to_string());
        }
        Ok(())
    }
}

/// `max(index(s) + 1)` over completed steps, or 0.
fn derived_step_index(completed: &[BuildStep]) -> usize {
    completed
        .iter()
        .map(|step| step.index() + 1)
        .max()
        .unwrap_or(0)
}

fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// A record found while listing the state directory.
#[derive(Debug)]
pub struct ListedRecord {
    pub build_id: String,
    pub record: Result<BuildRecord, StateError>,
}

/// Directory of build records.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StateError::Io {
            context: format!("creating build state directory '{}'", dir.display()),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, build_id: &str) -> Result<PathBuf, StateError> {
        if !is_valid_build_id(build_id) {
            return Err(StateError::InvalidId(build_id.to_string()));
        }
        Ok(self.dir.join(format!("{build_id}.{RECORD_EXTENSION}")))
    }

    pub fn exists(&self, build_id: &str) -> bool {
        self.record_path(build_id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Create and persist a fresh record. Fails if `build_id` is taken.
    pub fn create(&self, build_id: &str, config_name: &str) -> Result<BuildRecord, StateError> {
        let path = self.record_path(build_id)?;
        let record = BuildRecord::new(build_id, config_name);
        let tmp = self.write_temp(&path, &record)?;

        // hard_link refuses to replace an existing file, which makes the
        // existence check and the publish a single step.
        let published = match fs::hard_link(&tmp, &path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(StateError::AlreadyExists(build_id.to_string()))
            }
            Err(_) if path.exists() => Err(StateError::AlreadyExists(build_id.to_string())),
            Err(_) => fs::rename(&tmp, &path).map_err(|source| StateError::Io {
                context: format!("publishing build state '{}'", path.display()),
                source,
            }),
        };
        let _ = fs::remove_file(&tmp);
        published?;

        Ok(record)
    }

    /// Load a record. A missing file is [`StateError::NotFound`].
    pub fn load(&self, build_id: &str) -> Result<BuildRecord, StateError> {
        let path = self.record_path(build_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(build_id.to_string()))
            }
            Err(source) => {
                return Err(StateError::Io {
                    context: format!("reading build state '{}'", path.display()),
                    source,
                })
            }
        };
        parse_record(build_id, &bytes)
    }

    /// Atomically overwrite the durable copy of `record`.
    pub fn persist(&self, record: &BuildRecord) -> Result<(), StateError> {
        let path = self.record_path(&record.build_id)?;
        let tmp = self.write_temp(&path, record)?;
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            StateError::Io {
                context: format!(
                    "renaming temp file '{}' to '{}'",
                    tmp.display(),
                    path.display()
                ),
                source,
            }
        })
    }

    /// Record `step` as done and persist. Completing a step twice is a no-op.
    pub fn mark_step_completed(
        &self,
        record: &mut BuildRecord,
        step: BuildStep,
    ) -> Result<(), StateError> {
        if !record.insert_completed(step) {
            return Ok(());
        }
        if record.failed_step == Some(step) {
            record.failed_step = None;
            record.error_message = None;
        }
        self.persist(record)
    }

    /// Record a failure of `step` and persist. Completed steps are untouched.
    pub fn mark_step_failed(
        &self,
        record: &mut BuildRecord,
        step: BuildStep,
        message: impl Into<String>,
    ) -> Result<(), StateError> {
        record.failed_step = Some(step);
        record.error_message = Some(message.into());
        self.persist(record)
    }

    /// Remove the durable record. Deleting a missing record succeeds.
    pub fn delete(&self, build_id: &str) -> Result<(), StateError> {
        let path = self.record_path(build_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io {
                context: format!("removing build state '{}'", path.display()),
                source,
            }),
        }
    }

    /// Take the exclusive lock for `build_id`.
    pub fn lock(&self, build_id: &str) -> Result<BuildLock, StateError> {
        if !is_valid_build_id(build_id) {
            return Err(StateError::InvalidId(build_id.to_string()));
        }
        let path = self
            .dir
            .join(LOCKS_SUBDIR)
            .join(format!("{build_id}.lock"));
        lock::acquire(build_id, path)
    }

    /// Every record in the store, newest first. Unreadable records are
    /// reported in place rather than aborting the listing.
    pub fn list(&self) -> Result<Vec<ListedRecord>, StateError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StateError::Io {
            context: format!("reading build state directory '{}'", self.dir.display()),
            source,
        })?;

        let mut listed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StateError::Io {
                context: format!("iterating build state directory '{}'", self.dir.display()),
                source,
            })?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION)
            {
                continue;
            }
            let Some(build_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            listed.push(ListedRecord {
                build_id: build_id.to_string(),
                record: self.load(build_id),
            });
        }

        listed.sort_by(|a, b| {
            let key = |l: &ListedRecord| l.record.as_ref().ok().map(|r| r.started_at.clone());
            key(b)
                .cmp(&key(a))
                .then_with(|| a.build_id.cmp(&b.build_id))
        });
        Ok(listed)
    }

    fn write_temp(&self, path: &Path, record: &BuildRecord) -> Result<PathBuf, StateError> {
        let payload =
            serde_json::to_vec_pretty(record).map_err(|source| StateError::Serialize {
                build_id: record.build_id.clone(),
                source,
            })?;
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let io_err = |source| StateError::Io {
            context: format!("writing temp file '{}'", tmp.display()),
            source,
        };
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&payload).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(tmp)
    }
}

fn parse_record(build_id: &str, bytes: &[u8]) -> Result<BuildRecord, StateError> {
    let corrupt = |reason: String| StateError::Corrupt {
        build_id: build_id.to_string(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    let version = value
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| corrupt("missing schema_version".to_string()))?;
    if version != u64::from(SCHEMA_VERSION) {
        return Err(StateError::UnsupportedVersion {
            build_id: build_id.to_string(),
            found: version,
            expected: SCHEMA_VERSION,
        });
    }

    let record: BuildRecord = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
    record.check(build_id).map_err(corrupt)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path().join(".build_states")).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_create_then_load() {
        let (_tmp, store) = store();
        let created = store.create("abc123", "t1").unwrap();
        let loaded = store.load("abc123").unwrap();
        assert_eq!(created, loaded);
        assert_eq!(loaded.current_step(), 0);
        assert_eq!(loaded.next_step(), Some(BuildStep::Bootstrap));
        assert_eq!(loaded.started_at.len(), "20240101T000000Z".len());
    }

    #[test]
    fn test_create_refuses_existing_id() {
        let (_tmp, store) = store();
        store.create("abc123", "t1").unwrap();
        assert!(matches!(
            store.create("abc123", "t2"),
            Err(StateError::AlreadyExists(_))
        ));
        assert_eq!(store.load("abc123").unwrap().config_name, "t1");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_tmp, store) = store();
        assert!(matches!(store.load("nope"), Err(StateError::NotFound(_))));
    }

    #[test]
    fn test_invalid_id_never_touches_disk() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.load("../../etc/passwd"),
            Err(StateError::InvalidId(_))
        ));
    }

    #[test]
    fn test_mark_step_completed_is_idempotent() {
        let (_tmp, store) = store();
        let mut record = store.create("abc123", "t1").unwrap();

        store
            .mark_step_completed(&mut record, BuildStep::Bootstrap)
            .unwrap();
        let once = store.load("abc123").unwrap();

        store
            .mark_step_completed(&mut record, BuildStep::Bootstrap)
            .unwrap();
        let twice = store.load("abc123").unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.completed_steps(), &[BuildStep::Bootstrap]);
        assert_eq!(twice.current_step(), 1);
    }

    #[test]
    fn test_current_step_tracks_highest_completed() {
        let (_tmp, store) = store();
        let mut record = store.create("abc123", "t1").unwrap();
        store
            .mark_step_completed(&mut record, BuildStep::Packages)
            .unwrap();
        assert_eq!(record.current_step(), 2);
        store
            .mark_step_completed(&mut record, BuildStep::Bootstrap)
            .unwrap();
        assert_eq!(record.current_step(), 2);
        assert_eq!(record.next_step(), Some(BuildStep::CustomCommands));
    }

    #[test]
    fn test_mark_step_failed_keeps_completed() {
        let (_tmp, store) = store();
        let mut record = store.create("abc123", "t1").unwrap();
        store
            .mark_step_completed(&mut record, BuildStep::Bootstrap)
            .unwrap();
        store
            .mark_step_failed(&mut record, BuildStep::Packages, "apt-get exploded")
            .unwrap();

        let loaded = store.load("abc123").unwrap();
        assert_eq!(loaded.completed_steps(), &[BuildStep::Bootstrap]);
        assert_eq!(loaded.failed_step, Some(BuildStep::Packages));
        assert_eq!(loaded.error_message.as_deref(), Some("apt-get exploded"));

        let mut record = loaded;
        store
            .mark_step_completed(&mut record, BuildStep::Packages)
            .unwrap();
        assert_eq!(record.failed_step, None);
        assert_eq!(record.error_message, None);
    }

    #[test]
    fn test_persisted_record_survives_simulated_crash() {
        let (_tmp, store) = store();
        let mut record = store.create("abc123", "t1").unwrap();
        store
            .mark_step_completed(&mut record, BuildStep::Bootstrap)
            .unwrap();

        // In-memory progress that never reached disk is lost with the process.
        let mut unsaved = record.clone();
        unsaved.insert_completed(BuildStep::Packages);
        drop(unsaved);

        // A stray temp file from an interrupted write must not matter.
        fs::write(store.dir().join("abc123.tmp-99999"), b"{\"trunc").unwrap();

        let reloaded = StateStore::open(store.dir()).unwrap().load("abc123").unwrap();
        assert_eq!(reloaded.completed_steps(), &[BuildStep::Bootstrap]);
        assert_eq!(reloaded.next_step(), Some(BuildStep::Packages));
    }

    #[test]
    fn test_on_disk_field_names() {
        let (_tmp, store) = store();
        let mut record = store.create("abc123", "t1").unwrap();
        record.work_dir = Some(PathBuf::from("/tmp/build_abc123"));
        record.rootfs_path = Some(PathBuf::from("/tmp/build_abc123/rootfs"));
        store
            .mark_step_completed(&mut record, BuildStep::Bootstrap)
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.dir().join("abc123.json")).unwrap()).unwrap();
        assert_eq!(raw["build_id"], "abc123");
        assert_eq!(raw["config_name"], "t1");
        assert_eq!(raw["current_step"], 1);
        assert_eq!(raw["completed_steps"][0], "bootstrap");
        assert_eq!(raw["temp_dir"], "/tmp/build_abc123");
        assert_eq!(raw["rootfs_path"], "/tmp/build_abc123/rootfs");
        assert!(raw["failed_step"].is_null());
    }

    #[test]
    fn test_malformed_records_fail_closed() {
        let (_tmp, store) = store();
        let path = store.dir().join("abc123.json");

        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(store.load("abc123"), Err(StateError::Corrupt { .. })));

        let mut good = serde_json::to_value(BuildRecord::new("abc123", "t1")).unwrap();
        good["current_step"] = serde_json::json!(3);
        fs::write(&path, serde_json::to_vec(&good).unwrap()).unwrap();
        let err = store.load("abc123").unwrap_err();
        assert!(err.to_string().contains("current_step"));

        let mut extra = serde_json::to_value(BuildRecord::new("abc123", "t1")).unwrap();
        extra["surprise"] = serde_json::json!(true);
        fs::write(&path, serde_json::to_vec(&extra).unwrap()).unwrap();
        assert!(matches!(store.load("abc123"), Err(StateError::Corrupt { .. })));

        let renamed = serde_json::to_value(BuildRecord::new("zzz999", "t1")).unwrap();
        fs::write(&path, serde_json::to_vec(&renamed).unwrap()).unwrap();
        assert!(matches!(store.load("abc123"), Err(StateError::Corrupt { .. })));

        let mut future = serde_json::to_value(BuildRecord::new("abc123", "t1")).unwrap();
        future["schema_version"] = serde_json::json!(7);
        fs::write(&path, serde_json::to_vec(&future).unwrap()).unwrap();
        assert!(matches!(
            store.load("abc123"),
            Err(StateError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_tmp, store) = store();
        store.create("abc123", "t1").unwrap();
        store.delete("abc123").unwrap();
        store.delete("abc123").unwrap();
        assert!(!store.exists("abc123"));
    }

    #[test]
    fn test_lock_is_exclusive_per_build() {
        let (_tmp, store) = store();
        let held = store.lock("abc123").unwrap();
        assert!(matches!(store.lock("abc123"), Err(StateError::Locked(_))));
        let _other = store.lock("def456").unwrap();
        drop(held);
        store.lock("abc123").unwrap();
    }

    #[test]
    fn test_list_reports_corrupt_records_in_place() {
        let (_tmp, store) = store();
        store.create("good1", "t1").unwrap();
        fs::write(store.dir().join("bad1.json"), b"garbage").unwrap();
        fs::write(store.dir().join("good1.tmp-1"), b"ignored").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].build_id, "good1");
        assert!(listed[0].record.is_ok());
        assert_eq!(listed[1].build_id, "bad1");
        assert!(listed[1].record.is_err());
    }

    #[test]
    fn test_step_names_roundtrip_through_strings() {
        for step in BuildStep::ALL {
            assert_eq!(step.as_str().parse::<BuildStep>().unwrap(), step);
        }
        assert_eq!(BuildStep::at(4), Some(BuildStep::PackageArtifact));
        assert_eq!(BuildStep::at(5), None);
    }
}
