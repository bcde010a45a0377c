//! Per-entity run exclusion.
//!
//! Claims are tracked in memory. With a lock directory each claimed entity
//! also holds an exclusive lock on `<dir>/<entity>.lock`, so runs started by
//! other processes sharing the same home are excluded too.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{OrchestratorError, RunInProgressError, TransientIoError};

#[derive(Debug)]
struct Slot {
    run_id: Uuid,
    /// Released when the slot is dropped
    _lock: Option<File>,
}

/// Table of entities with an active run
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
    lock_dir: Option<PathBuf>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also exclude runs of other processes through lock files in `dir`
    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::default(),
            lock_dir: Some(dir.into()),
        }
    }

    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim every entity for `run_id`, or none of them.
    ///
    /// Fails with `RunInProgress` listing the entities that are already
    /// active here or locked by another process.
    pub fn try_claim(
        &self,
        run_id: Uuid,
        entity_ids: &[String],
    ) -> Result<RunClaim, OrchestratorError> {
        let mut table = self.table();

        let busy: Vec<String> = entity_ids
            .iter()
            .filter(|id| table.contains_key(id.as_str()))
            .cloned()
            .collect();
        if !busy.is_empty() {
            return Err(RunInProgressError { entity_ids: busy }.into());
        }

        let mut locks: Vec<Option<File>> = Vec::with_capacity(entity_ids.len());
        if let Some(dir) = &self.lock_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| TransientIoError::new(format!("create lock dir {}", dir.display()), e))?;

            let mut busy = Vec::new();
            for id in entity_ids {
                match lock_entity(dir, id)? {
                    Some(file) => locks.push(Some(file)),
                    None => busy.push(id.clone()),
                }
            }
            // Dropping `locks` releases whatever was acquired
            if !busy.is_empty() {
                return Err(RunInProgressError { entity_ids: busy }.into());
            }
        } else {
            locks.resize_with(entity_ids.len(), || None);
        }

        for (id, lock) in entity_ids.iter().zip(locks) {
            table.insert(id.clone(), Slot { run_id, _lock: lock });
        }

        Ok(RunClaim {
            runs: self.clone(),
            run_id,
        })
    }

    pub fn is_active(&self, entity_id: &str) -> bool {
        self.table().contains_key(entity_id)
    }

    /// Active run of an entity
    pub fn run_for(&self, entity_id: &str) -> Option<Uuid> {
        self.table().get(entity_id).map(|slot| slot.run_id)
    }

    fn release(&self, run_id: Uuid, entity_id: Option<&str>) {
        let mut table = self.table();
        match entity_id {
            Some(id) => {
                if table.get(id).map(|slot| slot.run_id) == Some(run_id) {
                    table.remove(id);
                }
            }
            None => table.retain(|_, slot| slot.run_id != run_id),
        }
    }
}

/// Lock file name: readable prefix plus a hash so distinct ids never collide
fn lock_file_name(entity_id: &str) -> String {
    let safe: String = entity_id
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let digest = Sha256::digest(entity_id.as_bytes());
    format!("{}-{}.lock", safe, hex::encode(&digest[..4]))
}

/// Take the entity's lock file. `None` when another holder has it.
fn lock_entity(dir: &Path, entity_id: &str) -> Result<Option<File>, TransientIoError> {
    let path = dir.join(lock_file_name(entity_id));
    let op = || format!("lock {}", path.display());

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| TransientIoError::new(op(), e))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
        Err(e) => Err(TransientIoError::new(op(), e)),
    }
}

/// Ownership of a run's entities; dropping it releases any still held
#[derive(Debug)]
pub struct RunClaim {
    runs: ActiveRuns,
    run_id: Uuid,
}

impl RunClaim {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Release one entity as soon as it reaches a terminal stage
    pub fn release(&self, entity_id: &str) {
        self.runs.release(self.run_id, Some(entity_id));
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.runs.release(self.run_id, None);
    }
}
