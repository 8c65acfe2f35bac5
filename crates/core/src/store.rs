//! The on-disk job store.
//!
//! One directory holds every durable artifact, keyed by job id:
//!
//! - `<jobid>.pkl` — journal record (`{request, attempts, completed}`)
//! - `<jobid>.input` — keyed shelf, key `metadata`
//! - `<jobid>.output` — keyed shelf, key `result`
//! - `<jobid>.lock` — runtime marker, present while the job is live
//! - `<jobid>.input.lock` / `<jobid>.output.lock` — shelf write locks
//! - `ARCHIVE/` — jobs moved out past the archive horizon
//!
//! Shelf reads of files that do not exist return `None`; files that exist
//! but cannot be decoded surface as [`StoreError::Unreadable`] so callers
//! can distinguish "not written yet" from "damaged".

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::job::{EngineResult, JobMetadata, JournalRecord};
use crate::lock::LockFile;

/// Extension of journal record files.
pub const JOURNAL_EXT: &str = "pkl";
/// Extension of metadata shelves.
pub const INPUT_EXT: &str = "input";
/// Extension of result shelves.
pub const OUTPUT_EXT: &str = "output";
/// Extension of lock files.
pub const LOCK_EXT: &str = "lock";
/// Subdirectory jobs are moved into past the archive horizon.
pub const ARCHIVE_DIR: &str = "ARCHIVE";

/// Key under which the metadata record lives in the input shelf.
pub const METADATA_KEY: &str = "metadata";
/// Key under which the engine result lives in the output shelf.
pub const RESULT_KEY: &str = "result";

/// Failures while touching the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error at a specific path.
    #[error("store io at {path:?}")]
    Io {
        /// The path being touched.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A file exists but its contents cannot be decoded.
    #[error("unreadable store record {path:?}: {reason}")]
    Unreadable {
        /// The damaged file.
        path: PathBuf,
        /// Decode failure description.
        reason: String,
    },
    /// An advisory lock was not released within the deadline.
    #[error("lock {path:?} not released within {deadline_secs}s")]
    LockTimeout {
        /// The lock file that stayed held.
        path: PathBuf,
        /// The configured deadline.
        deadline_secs: u64,
    },
    /// A record could not be encoded for writing.
    #[error("encode store record")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Handle on the store directory.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
    lock_deadline: Duration,
}

impl JobStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, lock_deadline: Duration) -> Result<JobStore, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| StoreError::io(&root, err))?;
        Ok(JobStore {
            root,
            lock_deadline,
        })
    }

    /// The store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_path(&self, jobid: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{jobid}.{ext}"))
    }

    /// Path of a job's journal record.
    pub fn journal_path(&self, jobid: &str) -> PathBuf {
        self.job_path(jobid, JOURNAL_EXT)
    }

    /// Path of a job's metadata shelf.
    pub fn input_path(&self, jobid: &str) -> PathBuf {
        self.job_path(jobid, INPUT_EXT)
    }

    /// Path of a job's result shelf.
    pub fn output_path(&self, jobid: &str) -> PathBuf {
        self.job_path(jobid, OUTPUT_EXT)
    }

    /// Path of a job's runtime lock marker.
    pub fn runtime_lock_path(&self, jobid: &str) -> PathBuf {
        self.job_path(jobid, LOCK_EXT)
    }

    // ------------------------------------------------------------------
    // Journal records

    /// Read a journal record; `None` when the job has never been submitted.
    pub fn read_journal(&self, jobid: &str) -> Result<Option<JournalRecord>, StoreError> {
        let path = self.journal_path(jobid);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StoreError::Unreadable {
                path,
                reason: err.to_string(),
            })
    }

    /// Write (or replace) a journal record atomically.
    pub fn write_journal(&self, jobid: &str, record: &JournalRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record).map_err(StoreError::Encode)?;
        persist_atomic(&self.journal_path(jobid), json.as_bytes())
    }

    /// Flip a journal record's `completed` flag to true.
    pub fn mark_journal_completed(&self, jobid: &str) -> Result<(), StoreError> {
        let Some(mut record) = self.read_journal(jobid)? else {
            return Ok(());
        };
        if record.completed {
            return Ok(());
        }
        record.completed = true;
        self.write_journal(jobid, &record)
    }

    // ------------------------------------------------------------------
    // Keyed shelves

    fn shelf_get(&self, path: &Path, key: &str) -> Result<Option<Value>, StoreError> {
        let lock_path = shelf_lock_path(path);
        let _lock = LockFile::acquire(&lock_path, self.lock_deadline)?;

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(path, err)),
        };
        let mut shelf: Map<String, Value> =
            serde_json::from_str(&raw).map_err(|err| StoreError::Unreadable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Ok(shelf.remove(key))
    }

    fn shelf_set(&self, path: &Path, key: &str, value: Value) -> Result<(), StoreError> {
        let lock_path = shelf_lock_path(path);
        let _lock = LockFile::acquire(&lock_path, self.lock_deadline)?;

        let mut shelf: Map<String, Value> = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Map::new(),
        };
        shelf.insert(key.to_string(), value);
        let json = serde_json::to_string_pretty(&shelf).map_err(StoreError::Encode)?;
        persist_atomic(path, json.as_bytes())
    }

    /// Read a job's metadata record; `None` when the shelf does not exist.
    pub fn read_metadata(&self, jobid: &str) -> Result<Option<JobMetadata>, StoreError> {
        let path = self.input_path(jobid);
        match self.shelf_get(&path, METADATA_KEY)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StoreError::Unreadable {
                    path,
                    reason: err.to_string(),
                }),
        }
    }

    /// Write a job's metadata record.
    pub fn write_metadata(&self, jobid: &str, metadata: &JobMetadata) -> Result<(), StoreError> {
        let value = serde_json::to_value(metadata).map_err(StoreError::Encode)?;
        self.shelf_set(&self.input_path(jobid), METADATA_KEY, value)
    }

    /// Read a job's engine result; `None` when the shelf does not exist.
    pub fn read_result(&self, jobid: &str) -> Result<Option<EngineResult>, StoreError> {
        let path = self.output_path(jobid);
        match self.shelf_get(&path, RESULT_KEY)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StoreError::Unreadable {
                    path,
                    reason: err.to_string(),
                }),
        }
    }

    /// Write a job's engine result.
    pub fn write_result(&self, jobid: &str, result: &EngineResult) -> Result<(), StoreError> {
        let value = serde_json::to_value(result).map_err(StoreError::Encode)?;
        self.shelf_set(&self.output_path(jobid), RESULT_KEY, value)
    }

    // ------------------------------------------------------------------
    // Runtime lock markers

    /// Create a job's runtime lock marker (idempotent).
    pub fn create_runtime_lock(&self, jobid: &str) -> Result<(), StoreError> {
        let path = self.runtime_lock_path(jobid);
        fs::write(&path, b"").map_err(|err| StoreError::io(&path, err))
    }

    /// Remove a job's runtime lock marker (idempotent).
    pub fn remove_runtime_lock(&self, jobid: &str) -> Result<(), StoreError> {
        let path = self.runtime_lock_path(jobid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    // ------------------------------------------------------------------
    // Directory-level operations

    /// Ids of every job with a journal record, in directory order.
    pub fn journal_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|err| StoreError::io(&self.root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(&self.root, err))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(JOURNAL_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Delete every `*.lock` file in the store root.
    ///
    /// Held locks cannot survive a process restart, so any lock present at
    /// startup is leftover state.
    pub fn sweep_locks(&self) -> Result<usize, StoreError> {
        let mut swept = 0;
        let entries = fs::read_dir(&self.root).map_err(|err| StoreError::io(&self.root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(&self.root, err))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOCK_EXT) {
                fs::remove_file(&path).map_err(|err| StoreError::io(&path, err))?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Move every file belonging to `jobid` into the archive directory.
    ///
    /// Returns the number of files moved.
    pub fn archive_job(&self, jobid: &str) -> Result<usize, StoreError> {
        let archive = self.root.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive).map_err(|err| StoreError::io(&archive, err))?;

        let prefix = format!("{jobid}.");
        let mut moved = 0;
        let entries = fs::read_dir(&self.root).map_err(|err| StoreError::io(&self.root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(&self.root, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) {
                let dest = archive.join(name);
                fs::rename(&path, &dest).map_err(|err| StoreError::io(&path, err))?;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

fn shelf_lock_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.{LOCK_EXT}", path.display()))
}

fn persist_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&tmp, bytes).map_err(|err| StoreError::io(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| StoreError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExecStatus, JobTimes, RequestContext, SubmitEnvelope};

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path(), Duration::from_secs(5)).unwrap();
        (dir, store)
    }

    fn envelope(action: &str) -> SubmitEnvelope {
        SubmitEnvelope {
            action: action.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            callback_url: None,
            callback_method: None,
            callback_detailed: false,
            request: RequestContext::default(),
            lane: "slow".to_string(),
            restart_jobid: None,
            restart_jobcounter: None,
            restart_received: None,
        }
    }

    fn metadata(jobcounter: u64) -> JobMetadata {
        JobMetadata {
            jobcounter,
            action: "helloworld".to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            callback_url: None,
            callback_method: None,
            callback_detailed: false,
            request: RequestContext::default(),
            lane: "slow".to_string(),
            times: JobTimes::default(),
        }
    }

    #[test]
    fn journal_round_trips() {
        let (_dir, store) = store();
        assert!(store.read_journal("job-1").unwrap().is_none());

        let record = JournalRecord {
            request: envelope("helloworld"),
            attempts: 0,
            completed: false,
        };
        store.write_journal("job-1", &record).unwrap();
        assert_eq!(store.read_journal("job-1").unwrap().unwrap(), record);

        store.mark_journal_completed("job-1").unwrap();
        assert!(store.read_journal("job-1").unwrap().unwrap().completed);
    }

    #[test]
    fn shelves_round_trip_and_release_locks() {
        let (dir, store) = store();

        store.write_metadata("job-1", &metadata(7)).unwrap();
        let back = store.read_metadata("job-1").unwrap().unwrap();
        assert_eq!(back.jobcounter, 7);

        store
            .write_result(
                "job-1",
                &EngineResult {
                    exec_status: ExecStatus::Completed,
                    json_result: "\"ok\"".to_string(),
                    jobid: "job-1".to_string(),
                },
            )
            .unwrap();
        let result = store.read_result("job-1").unwrap().unwrap();
        assert_eq!(result.exec_status, ExecStatus::Completed);

        // Shelf locks are transient.
        assert!(!dir.path().join("job-1.input.lock").exists());
        assert!(!dir.path().join("job-1.output.lock").exists());
    }

    #[test]
    fn missing_shelves_read_as_none() {
        let (_dir, store) = store();
        assert!(store.read_metadata("ghost").unwrap().is_none());
        assert!(store.read_result("ghost").unwrap().is_none());
    }

    #[test]
    fn damaged_shelf_is_unreadable() {
        let (dir, store) = store();
        fs::write(dir.path().join("job-1.output"), b"not json").unwrap();
        let err = store.read_result("job-1").unwrap_err();
        assert!(matches!(err, StoreError::Unreadable { .. }));
    }

    #[test]
    fn journal_ids_lists_only_journals() {
        let (dir, store) = store();
        let record = JournalRecord {
            request: envelope("helloworld"),
            attempts: 0,
            completed: false,
        };
        store.write_journal("a", &record).unwrap();
        store.write_journal("b", &record).unwrap();
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let mut ids = store.journal_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn sweep_removes_all_lock_files() {
        let (dir, store) = store();
        fs::write(dir.path().join("a.lock"), b"").unwrap();
        fs::write(dir.path().join("b.input.lock"), b"").unwrap();
        assert_eq!(store.sweep_locks().unwrap(), 2);
        assert_eq!(store.sweep_locks().unwrap(), 0);
    }

    #[test]
    fn archive_moves_whole_job() {
        let (dir, store) = store();
        let record = JournalRecord {
            request: envelope("helloworld"),
            attempts: 0,
            completed: true,
        };
        store.write_journal("old", &record).unwrap();
        store.write_metadata("old", &metadata(1)).unwrap();
        // A different job sharing the prefix must stay put.
        store.write_journal("old2", &record).unwrap();

        let moved = store.archive_job("old").unwrap();
        assert_eq!(moved, 2);
        assert!(!dir.path().join("old.pkl").exists());
        assert!(dir.path().join("ARCHIVE/old.pkl").exists());
        assert!(dir.path().join("ARCHIVE/old.input").exists());
        assert!(dir.path().join("old2.pkl").exists());
    }

    #[test]
    fn runtime_lock_marker_lifecycle() {
        let (dir, store) = store();
        store.create_runtime_lock("job-1").unwrap();
        assert!(dir.path().join("job-1.lock").exists());
        store.remove_runtime_lock("job-1").unwrap();
        store.remove_runtime_lock("job-1").unwrap();
        assert!(!dir.path().join("job-1.lock").exists());
    }
}
