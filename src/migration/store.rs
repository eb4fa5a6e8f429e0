//! Migration job persistence
//!
//! A job is saved as a whole after every change. The file store keeps one
//! checksummed document per job under `<data_dir>/migration/`, so a
//! restarted process resumes by loading the job and calling `advance()`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::errors::{MigrationError, MigrationResult};
use super::job::{JobId, MigrationJob};
use crate::durable::{self, DurableError};

/// Directory under the data dir holding job documents.
pub const MIGRATION_DIR_NAME: &str = "migration";

/// Durable job records.
pub trait MigrationStore: Send + Sync {
    /// Insert or replace a job.
    fn save(&self, job: &MigrationJob) -> MigrationResult<()>;

    /// Load a job.
    fn load(&self, id: JobId) -> MigrationResult<Option<MigrationJob>>;

    /// Every job, ordered by creation time.
    fn list(&self) -> MigrationResult<Vec<MigrationJob>>;
}

fn by_creation(mut jobs: Vec<MigrationJob>) -> Vec<MigrationJob> {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    jobs
}

// =============================================================================
// MEMORY
// =============================================================================

/// Jobs in a map; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryMigrationStore {
    jobs: RwLock<BTreeMap<JobId, MigrationJob>>,
}

impl MemoryMigrationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MigrationStore for MemoryMigrationStore {
    fn save(&self, job: &MigrationJob) -> MigrationResult<()> {
        let mut jobs = self.jobs.write().map_err(|_| MigrationError::LockPoisoned)?;
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn load(&self, id: JobId) -> MigrationResult<Option<MigrationJob>> {
        let jobs = self.jobs.read().map_err(|_| MigrationError::LockPoisoned)?;
        Ok(jobs.get(&id).cloned())
    }

    fn list(&self) -> MigrationResult<Vec<MigrationJob>> {
        let jobs = self.jobs.read().map_err(|_| MigrationError::LockPoisoned)?;
        Ok(by_creation(jobs.values().cloned().collect()))
    }
}

// =============================================================================
// FILE
// =============================================================================

/// One document per job.
#[derive(Debug)]
pub struct FileMigrationStore {
    dir: PathBuf,
}

impl FileMigrationStore {
    /// Store under `<data_dir>/migration/`. The directory is created on
    /// first save.
    pub fn open(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(MIGRATION_DIR_NAME),
        }
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl MigrationStore for FileMigrationStore {
    fn save(&self, job: &MigrationJob) -> MigrationResult<()> {
        Ok(durable::write_document(&self.path_for(job.id), job)?)
    }

    fn load(&self, id: JobId) -> MigrationResult<Option<MigrationJob>> {
        Ok(durable::read_document(&self.path_for(id))?)
    }

    fn list(&self) -> MigrationResult<Vec<MigrationJob>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(DurableError::Io {
                    path: self.dir.display().to_string(),
                    source: e,
                }
                .into())
            }
        };

        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(job) = durable::read_document::<MigrationJob>(&path)? {
                jobs.push(job);
            }
        }
        Ok(by_creation(jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::job::MigrationRequest;
    use chrono::Utc;
    use tempfile::TempDir;

    fn job() -> MigrationJob {
        MigrationJob::new(JobId::new(), MigrationRequest::new("src.db", "dst.db", 50000), Utc::now())
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let saved = job();
        FileMigrationStore::open(dir.path()).save(&saved).unwrap();

        let reopened = FileMigrationStore::open(dir.path());
        assert_eq!(reopened.load(saved.id).unwrap(), Some(saved.clone()));
        assert_eq!(reopened.list().unwrap(), vec![saved]);
    }

    #[test]
    fn test_empty_file_store_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileMigrationStore::open(dir.path());
        assert!(store.list().unwrap().is_empty());
        assert!(store.load(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_replaces() {
        let store = MemoryMigrationStore::new();
        let mut saved = job();
        store.save(&saved).unwrap();
        saved.disconnect_confirmed = true;
        store.save(&saved).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.load(saved.id).unwrap().unwrap().disconnect_confirmed);
    }
}
