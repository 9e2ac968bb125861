//! One update cycle, start to finish.
//!
//! `Init -> LockAcquired -> SourceResolved -> VersionCompared`, then either
//! `UpToDate` or `ManifestApplied -> VersionCommitted`. Any stage may end in
//! `Failed`. The lock is released and scratch files removed on every path out
//! of [`UpdateCycle::run`] once the lock was taken.

use std::env;
use std::fmt::{self, Display};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::CycleError;
use crate::lock::{self, FileLockStore, LockGuard, LockOutcome, ProcessProbe, ReclaimReason};
use crate::log::UpdateLog;
use crate::manifest::{apply_manifest, manifest_url, parse_manifest, Manifest, ManifestReport};
use crate::transport::{partial_path, ErrorClass, Transport, TransportError};
use crate::version::{
    commit_version, fetch_remote_version, read_local_version, resolve_source, versions_match,
    SourceLocation,
};

const VERSION_SCRATCH: &str = "remote-VERSION.tmp";
const MANIFEST_SCRATCH: &str = "remote-manifest.tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Init,
    LockAcquired,
    SourceResolved,
    VersionCompared,
    UpToDate,
    ManifestApplied,
    VersionCommitted,
    Failed,
}

impl CycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::LockAcquired => "lock_acquired",
            Self::SourceResolved => "source_resolved",
            Self::VersionCompared => "version_compared",
            Self::UpToDate => "up_to_date",
            Self::ManifestApplied => "manifest_applied",
            Self::VersionCommitted => "version_committed",
            Self::Failed => "failed",
        }
    }
}

impl Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    UpToDate { version: String },
    Updated { from: Option<String>, to: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub source: SourceLocation,
    pub final_state: CycleState,
    pub manifest: Option<ManifestReport>,
}

/// What a cycle learned before it ended, successful or not.
#[derive(Debug, Clone, Default)]
pub struct CycleProgress {
    pub source: Option<SourceLocation>,
    pub local_version_before: Option<String>,
    pub remote_version: Option<String>,
    pub manifest: Option<ManifestReport>,
}

pub struct UpdateCycle<'a, T: Transport + ?Sized, P: ProcessProbe + ?Sized> {
    settings: &'a Settings,
    transport: &'a T,
    probe: &'a P,
    log: &'a mut UpdateLog,
    pid: u32,
    state: CycleState,
    progress: CycleProgress,
}

impl<'a, T: Transport + ?Sized, P: ProcessProbe + ?Sized> UpdateCycle<'a, T, P> {
    pub fn new(
        settings: &'a Settings,
        transport: &'a T,
        probe: &'a P,
        log: &'a mut UpdateLog,
        pid: u32,
    ) -> Self {
        Self {
            settings,
            transport,
            probe,
            log,
            pid,
            state: CycleState::Init,
            progress: CycleProgress::default(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn progress(&self) -> &CycleProgress {
        &self.progress
    }

    pub fn run(&mut self) -> Result<CycleReport, CycleError> {
        self.state = CycleState::Init;
        self.progress = CycleProgress::default();

        match self.run_guarded() {
            Ok(outcome) => {
                let source = self
                    .progress
                    .source
                    .clone()
                    .unwrap_or_else(|| resolve_source(&self.settings.source));
                Ok(CycleReport {
                    outcome,
                    source,
                    final_state: self.state,
                    manifest: self.progress.manifest.clone(),
                })
            }
            Err(err) => {
                debug!(from = %self.state, error = %err, "cycle failed");
                self.state = CycleState::Failed;
                self.log.error(format!("Update cycle failed: {}", err));
                Err(err)
            }
        }
    }

    fn run_guarded(&mut self) -> Result<CycleOutcome, CycleError> {
        ensure_directories(self.settings)?;

        let store = FileLockStore::new(&self.settings.lock_file);
        match lock::try_acquire(
            &store,
            self.pid,
            self.settings.lock_timeout(),
            self.probe,
            SystemTime::now(),
        )? {
            LockOutcome::Acquired => {}
            LockOutcome::Reclaimed {
                previous_owner,
                reason,
                age,
            } => {
                let owner = previous_owner
                    .map(|pid| format!("pid {}", pid))
                    .unwrap_or_else(|| "unknown owner".to_string());
                let why = match reason {
                    ReclaimReason::Stale => "stale",
                    ReclaimReason::Orphaned => "orphaned",
                };
                self.log.warning(format!(
                    "Removed {} lock held by {} ({}s old)",
                    why,
                    owner,
                    age.as_secs()
                ));
            }
            LockOutcome::HeldBy { owner, age } => {
                debug!(owner, age_secs = age.as_secs(), "lock held by live process");
                return Err(CycleError::LockContention { owner });
            }
        }

        let guard = LockGuard::new(store, self.pid);
        self.advance(CycleState::LockAcquired);

        let result = self.run_locked();

        self.remove_scratch();
        match guard.release() {
            Ok(true) => {}
            Ok(false) => self
                .log
                .warning("Update lock was no longer ours at release; left in place"),
            Err(err) => self.log.warning(format!("Failed releasing update lock: {}", err)),
        }

        result
    }

    fn run_locked(&mut self) -> Result<CycleOutcome, CycleError> {
        let source = resolve_source(&self.settings.source);
        debug!(base_url = %source.base_url, origin = ?source.origin, "source resolved");
        self.progress.source = Some(source.clone());
        self.advance(CycleState::SourceResolved);

        let local = self.read_local();
        self.progress.local_version_before = local.clone();

        let remote = fetch_remote_version(
            self.transport,
            &source,
            &self.settings.state_dir.join(VERSION_SCRATCH),
        )
        .map_err(|source| CycleError::Transport {
            what: "remote version",
            source,
        })?;
        self.progress.remote_version = Some(remote.clone());
        self.advance(CycleState::VersionCompared);

        if versions_match(local.as_deref(), &remote) {
            self.advance(CycleState::UpToDate);
            self.log
                .ok(format!("Version {} is current, no update needed", remote));
            return Ok(CycleOutcome::UpToDate { version: remote });
        }

        self.log.info(format!(
            "Updating {} -> {} from {}",
            local.as_deref().unwrap_or("(none)"),
            remote,
            source.base_url
        ));

        let manifest = self.fetch_manifest(&source)?;
        if manifest.is_empty() {
            self.log.warning(format!(
                "Manifest lists no installable assets ({} line(s) skipped)",
                manifest.line_errors.len()
            ));
        }

        let report = apply_manifest(
            self.transport,
            &source,
            &self.settings.scripts_dir,
            &manifest,
            self.log,
        )?;
        self.progress.manifest = Some(report);
        self.advance(CycleState::ManifestApplied);

        commit_version(&self.settings.version_file, &remote).map_err(|source| {
            CycleError::Persistence {
                path: self.settings.version_file.clone(),
                source,
            }
        })?;
        self.advance(CycleState::VersionCommitted);
        self.log.ok(format!("Installed version {}", remote));

        Ok(CycleOutcome::Updated {
            from: local,
            to: remote,
        })
    }

    fn read_local(&mut self) -> Option<String> {
        match read_local_version(&self.settings.version_file) {
            Ok(version) => version,
            Err(err) => {
                self.log.warning(format!(
                    "Could not read local version {}: {}; treating as not installed",
                    self.settings.version_file.display(),
                    err
                ));
                None
            }
        }
    }

    fn fetch_manifest(&mut self, source: &SourceLocation) -> Result<Manifest, CycleError> {
        let url = manifest_url(source);
        let scratch = self.settings.state_dir.join(MANIFEST_SCRATCH);
        let report = self
            .transport
            .fetch(&url, &scratch)
            .map_err(|source| CycleError::Transport {
                what: "manifest",
                source,
            })?;

        let raw = fs::read_to_string(&scratch);
        discard(&scratch);
        let raw = raw.map_err(|err| CycleError::Transport {
            what: "manifest",
            source: TransportError::new(
                &url,
                report.attempts,
                ErrorClass::Permanent,
                format!("downloaded manifest is unreadable: {}", err),
            ),
        })?;

        Ok(parse_manifest(&raw))
    }

    fn remove_scratch(&self) {
        for name in [VERSION_SCRATCH, MANIFEST_SCRATCH] {
            let path = self.settings.state_dir.join(name);
            discard(&path);
            discard(&partial_path(&path));
        }
    }

    fn advance(&mut self, next: CycleState) {
        debug!(from = %self.state, to = %next, "cycle state");
        self.state = next;
    }
}

/// Creates every directory the cycle writes into.
pub fn ensure_directories(settings: &Settings) -> Result<(), CycleError> {
    for dir in settings.required_dirs() {
        fs::create_dir_all(&dir).map_err(|source| CycleError::Directory {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub source: SourceLocation,
    pub local_version: Option<String>,
    pub remote_version: String,
    pub up_to_date: bool,
}

/// Compares local and remote versions without taking the lock or touching
/// installed files.
pub fn check_for_update<T: Transport + ?Sized>(
    settings: &Settings,
    transport: &T,
    pid: u32,
) -> Result<CheckReport, CycleError> {
    let source = resolve_source(&settings.source);
    let local_version = match read_local_version(&settings.version_file) {
        Ok(version) => version,
        Err(err) => {
            warn!(path = %settings.version_file.display(), error = %err, "local version unreadable");
            None
        }
    };

    let scratch = check_scratch_dir(&settings.state_dir).join(format!("check-VERSION.{pid}.tmp"));
    let fetched = fetch_remote_version(transport, &source, &scratch);
    discard(&partial_path(&scratch));
    let remote_version = fetched.map_err(|source| CycleError::Transport {
        what: "remote version",
        source,
    })?;

    Ok(CheckReport {
        up_to_date: versions_match(local_version.as_deref(), &remote_version),
        source,
        local_version,
        remote_version,
    })
}

fn check_scratch_dir(state_dir: &Path) -> PathBuf {
    if state_dir.is_dir() {
        state_dir.to_path_buf()
    } else {
        env::temp_dir()
    }
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed removing scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{check_for_update, CycleOutcome, CycleState, UpdateCycle};
    use crate::config::Settings;
    use crate::error::CycleError;
    use crate::lock::ProcessProbe;
    use crate::log::UpdateLog;
    use crate::transport::{ErrorClass, FetchReport, Transport, TransportError};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    const BASE: &str = "https://assets.test/agent/main";

    #[derive(Default)]
    struct MapTransport {
        files: HashMap<String, String>,
        requested: RefCell<Vec<String>>,
    }

    impl MapTransport {
        fn with(mut self, path: &str, body: &str) -> Self {
            self.files.insert(format!("{}/{}", BASE, path), body.to_string());
            self
        }
    }

    impl Transport for MapTransport {
        fn fetch(&self, url: &str, destination: &Path) -> Result<FetchReport, TransportError> {
            self.requested.borrow_mut().push(url.to_string());
            match self.files.get(url) {
                Some(body) => {
                    fs::write(destination, body).expect("write destination");
                    Ok(FetchReport {
                        attempts: 1,
                        latency_ms: 0,
                        bytes: body.len() as u64,
                    })
                }
                None => Err(TransportError::new(
                    url,
                    1,
                    ErrorClass::Permanent,
                    "HTTP 404",
                )),
            }
        }
    }

    struct NobodyAlive;

    impl ProcessProbe for NobodyAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    fn settings(root: &Path) -> Settings {
        let mut settings = Settings::rooted_at(root);
        settings.source.base_url = Some(BASE.to_string());
        settings
    }

    #[test]
    fn manifest_without_valid_entries_still_commits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let transport = MapTransport::default()
            .with("VERSION", "2.0.0\n")
            .with("manifest.txt", "# nothing\nbroken-line\n");
        let mut log = UpdateLog::detached();

        let mut cycle = UpdateCycle::new(&settings, &transport, &NobodyAlive, &mut log, 9);
        let report = cycle.run().expect("cycle");
        assert_eq!(cycle.state(), CycleState::VersionCommitted);
        assert_eq!(
            report.outcome,
            CycleOutcome::Updated {
                from: None,
                to: "2.0.0".to_string()
            }
        );
        let manifest = report.manifest.expect("manifest report");
        assert!(manifest.installed.is_empty());
        assert_eq!(manifest.skipped_lines.len(), 1);
        assert_eq!(
            fs::read_to_string(&settings.version_file).expect("marker"),
            "2.0.0\n"
        );
        assert!(!settings.lock_file.exists());
    }

    #[test]
    fn scratch_files_do_not_survive_a_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let transport = MapTransport::default()
            .with("VERSION", "2.0.0\n")
            .with("manifest.txt", "probe.sh probe\n")
            .with("scripts/probe.sh", "#!/bin/sh\n");
        let mut log = UpdateLog::detached();

        let report = UpdateCycle::new(&settings, &transport, &NobodyAlive, &mut log, 9)
            .run()
            .expect("cycle");
        assert_eq!(
            report.outcome,
            CycleOutcome::Updated {
                from: None,
                to: "2.0.0".to_string()
            }
        );
        assert_eq!(report.final_state, CycleState::VersionCommitted);
        let leftovers = fs::read_dir(&settings.state_dir)
            .expect("state dir")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn check_reports_without_creating_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        fs::write(&settings.version_file, "1.0.0\n").expect("seed version");
        let transport = MapTransport::default().with("VERSION", "1.1.0");

        let report = check_for_update(&settings, &transport, 9).expect("check");
        assert!(!report.up_to_date);
        assert_eq!(report.local_version.as_deref(), Some("1.0.0"));
        assert_eq!(report.remote_version, "1.1.0");
        assert!(!settings.lock_file.exists());
        assert_eq!(
            transport.requested.borrow().as_slice(),
            &[format!("{}/VERSION", BASE)]
        );
    }
}
