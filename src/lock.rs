//! At-most-one update cycle per host.
//!
//! The staleness and liveness policy lives in [`try_acquire`] and works
//! against any [`LockStore`]; [`FileLockStore`] is the production backend,
//! holding the owner PID as file content and the acquisition time as the
//! file's mtime.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed reading lock {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed creating lock {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed removing lock {}: {source}", .path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("lock record kept changing while acquiring; giving up")]
    Unsettled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// `None` when the stored content is not a process identifier.
    pub owner: Option<u32>,
    pub acquired_at: SystemTime,
}

pub trait LockStore {
    fn read(&self) -> Result<Option<LockRecord>, LockError>;
    /// Creates the record only if none exists; `Ok(false)` means one already did.
    fn create(&self, owner: u32) -> Result<bool, LockError>;
    fn remove(&self) -> Result<(), LockError>;
}

impl<T: LockStore + ?Sized> LockStore for &T {
    fn read(&self) -> Result<Option<LockRecord>, LockError> {
        (**self).read()
    }

    fn create(&self, owner: u32) -> Result<bool, LockError> {
        (**self).create(owner)
    }

    fn remove(&self) -> Result<(), LockError> {
        (**self).remove()
    }
}

pub trait ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    Stale,
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Reclaimed {
        previous_owner: Option<u32>,
        reason: ReclaimReason,
        age: Duration,
    },
    HeldBy {
        owner: u32,
        age: Duration,
    },
}

const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Tries to become the lock owner.
///
/// A record older than `stale_after` is reclaimed whether or not its owner is
/// alive. A younger record is reclaimed only when its owner is gone.
pub fn try_acquire<S, P>(
    store: &S,
    owner: u32,
    stale_after: Duration,
    probe: &P,
    now: SystemTime,
) -> Result<LockOutcome, LockError>
where
    S: LockStore + ?Sized,
    P: ProcessProbe + ?Sized,
{
    let mut reclaimed: Option<(Option<u32>, ReclaimReason, Duration)> = None;

    for _ in 0..MAX_ACQUIRE_ATTEMPTS {
        if store.create(owner)? {
            return Ok(match reclaimed {
                Some((previous_owner, reason, age)) => LockOutcome::Reclaimed {
                    previous_owner,
                    reason,
                    age,
                },
                None => LockOutcome::Acquired,
            });
        }

        let Some(record) = store.read()? else {
            // Released between our create and read.
            continue;
        };
        let age = record_age(&record, now);
        match judge(&record, age, owner, stale_after, probe) {
            Ok(holder) => return Ok(LockOutcome::HeldBy { owner: holder, age }),
            Err(reason) => {
                debug!(
                    previous_owner = ?record.owner,
                    age_secs = age.as_secs(),
                    reason = ?reason,
                    "reclaiming lock"
                );
                store.remove()?;
                reclaimed = Some((record.owner, reason, age));
            }
        }
    }

    Err(LockError::Unsettled)
}

fn judge<P: ProcessProbe + ?Sized>(
    record: &LockRecord,
    age: Duration,
    self_pid: u32,
    stale_after: Duration,
    probe: &P,
) -> Result<u32, ReclaimReason> {
    if age > stale_after {
        return Err(ReclaimReason::Stale);
    }
    match record.owner {
        // A record naming our own PID is a leftover from an earlier process that
        // happened to share it; we do not hold it yet.
        Some(pid) if pid != self_pid && probe.is_alive(pid) => Ok(pid),
        // No owner also covers a competitor that created the file but has not
        // written its PID yet; reclaiming it falls inside the accepted
        // create/inspect race.
        _ => Err(ReclaimReason::Orphaned),
    }
}

fn record_age(record: &LockRecord, now: SystemTime) -> Duration {
    now.duration_since(record.acquired_at).unwrap_or_default()
}

/// Removes the record only if it still names `owner`.
pub fn release_if_owned<S: LockStore + ?Sized>(store: &S, owner: u32) -> Result<bool, LockError> {
    match store.read()? {
        Some(record) if record.owner == Some(owner) => {
            store.remove()?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Unconditionally removes the record. Returns whether one existed.
pub fn force_remove<S: LockStore + ?Sized>(store: &S) -> Result<bool, LockError> {
    let existed = store.read()?.is_some();
    store.remove()?;
    Ok(existed)
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub exists: bool,
    pub owner: Option<u32>,
    pub age_secs: Option<u64>,
    pub stale_after_secs: u64,
    pub stale: Option<bool>,
    pub owner_alive: Option<bool>,
}

pub fn inspect<S, P>(
    store: &S,
    stale_after: Duration,
    probe: &P,
    now: SystemTime,
) -> Result<LockStatus, LockError>
where
    S: LockStore + ?Sized,
    P: ProcessProbe + ?Sized,
{
    let Some(record) = store.read()? else {
        return Ok(LockStatus {
            exists: false,
            owner: None,
            age_secs: None,
            stale_after_secs: stale_after.as_secs(),
            stale: None,
            owner_alive: None,
        });
    };

    let age = record_age(&record, now);
    Ok(LockStatus {
        exists: true,
        owner: record.owner,
        age_secs: Some(age.as_secs()),
        stale_after_secs: stale_after.as_secs(),
        stale: Some(age > stale_after),
        owner_alive: record.owner.map(|pid| probe.is_alive(pid)),
    })
}

/// Holds an acquired lock and releases it on drop if nobody else took it over.
#[derive(Debug)]
pub struct LockGuard<S: LockStore> {
    store: S,
    owner: u32,
    released: bool,
}

impl<S: LockStore> LockGuard<S> {
    pub fn new(store: S, owner: u32) -> Self {
        Self {
            store,
            owner,
            released: false,
        }
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Explicit release; `Ok(false)` means the record was no longer ours.
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        release_if_owned(&self.store, self.owner)
    }
}

impl<S: LockStore> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_if_owned(&self.store, self.owner) {
            warn!(owner = self.owner, error = %err, "failed releasing update lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LockStore for FileLockStore {
    fn read(&self) -> Result<Option<LockRecord>, LockError> {
        let read_err = |source| LockError::Read {
            path: self.path.clone(),
            source,
        };

        let raw = match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(read_err(err)),
        };
        let acquired_at = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(read_err(err)),
        };

        Ok(Some(LockRecord {
            owner: raw.trim().parse::<u32>().ok(),
            acquired_at,
        }))
    }

    fn create(&self, owner: u32) -> Result<bool, LockError> {
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(LockError::Create {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };

        if let Err(err) = file.write_all(format!("{owner}\n").as_bytes()) {
            let _ = fs::remove_file(&self.path);
            return Err(LockError::Create {
                path: self.path.clone(),
                source: err,
            });
        }
        Ok(true)
    }

    fn remove(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LockError::Remove {
                path: self.path.clone(),
                source: err,
            }),
        }
    }
}

/// Liveness via `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        #[cfg(unix)]
        {
            // SAFETY: signal 0 performs the permission and existence checks only.
            #[allow(unsafe_code)]
            let result = unsafe { libc::kill(pid, 0) };
            if result == 0 {
                return true;
            }
            // EPERM: the process exists but belongs to someone else.
            io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            true
        }
    }
}
