use std::process;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{DoctorReport, Settings};
use crate::error::CycleError;
use crate::lock::{self, FileLockStore, SystemProcessProbe};
use crate::log::UpdateLog;
use crate::telemetry::{CycleRecord, TelemetryStore};
use crate::transport::CommandTransport;
use crate::updater::{self, CycleOutcome, CycleReport, UpdateCycle};
use crate::version::read_local_version;

pub struct FleetSyncApp {
    settings: Settings,
    pid: u32,
}

impl FleetSyncApp {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            pid: process::id(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn doctor(&self) -> DoctorReport {
        self.settings.doctor_report()
    }

    /// Runs one update cycle against the real transport tool and lock file.
    pub fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now().to_rfc3339();

        if let Err(err) = updater::ensure_directories(&self.settings) {
            self.record_failure(&started_at, &err);
            return Err(err);
        }

        let mut log = match UpdateLog::open(&self.settings.log_file) {
            Ok(log) => log,
            Err(err) => {
                warn!(
                    path = %self.settings.log_file.display(),
                    error = %err,
                    "update log unavailable, continuing without it"
                );
                UpdateLog::detached()
            }
        };

        let transport = match CommandTransport::select(&self.settings.transport) {
            Ok(transport) => transport,
            Err(err) => {
                let err = CycleError::from(err);
                log.error(format!("Update cycle failed: {}", err));
                self.record_failure(&started_at, &err);
                return Err(err);
            }
        };

        let probe = SystemProcessProbe;
        let mut cycle = UpdateCycle::new(&self.settings, &transport, &probe, &mut log, self.pid);
        let result = cycle.run();

        // The lock holder owns the record for this period.
        if let Err(CycleError::LockContention { owner }) = &result {
            debug!(owner, "lock contention, cycle record left to the holder");
            return result;
        }

        let progress = cycle.progress().clone();
        let final_state = cycle.state();
        let mut record = CycleRecord {
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            pid: self.pid,
            status: "failed".to_string(),
            final_state: final_state.to_string(),
            channel: progress.source.as_ref().map(|source| source.channel.clone()),
            base_url: progress.source.as_ref().map(|source| source.base_url.clone()),
            source_origin: progress.source.as_ref().map(|source| source.origin),
            local_version_before: progress.local_version_before.clone(),
            remote_version: progress.remote_version.clone(),
            assets_installed: Vec::new(),
            skipped_lines: 0,
            permission_warnings: 0,
            error_kind: None,
            error: None,
        };
        if let Some(manifest) = progress.manifest.as_ref() {
            record.assets_installed = manifest
                .installed
                .iter()
                .map(|asset| asset.name.clone())
                .collect();
            record.skipped_lines = manifest.skipped_lines.len();
            record.permission_warnings = manifest.permission_warnings.len();
        }
        match &result {
            Ok(report) => {
                record.status = match report.outcome {
                    CycleOutcome::UpToDate { .. } => "up_to_date",
                    CycleOutcome::Updated { .. } => "updated",
                }
                .to_string();
            }
            Err(err) => {
                record.error_kind = Some(err.kind().to_string());
                record.error = Some(err.to_string());
            }
        }
        self.persist_record(record);

        result
    }

    pub fn check_json(&self) -> Result<String> {
        let transport = CommandTransport::select(&self.settings.transport)?;
        let report = updater::check_for_update(&self.settings, &transport, self.pid)?;
        Ok(serde_json::to_string_pretty(&json!({
            "status": "ok",
            "transport": transport.tool().to_string(),
            "report": report
        }))
        .context("failed to encode check result")?)
    }

    pub fn status_json(&self) -> Result<String> {
        let local_version = read_local_version(&self.settings.version_file).with_context(|| {
            format!(
                "failed reading local version {}",
                self.settings.version_file.display()
            )
        })?;
        let store = FileLockStore::new(&self.settings.lock_file);
        let lock_status = lock::inspect(
            &store,
            self.settings.lock_timeout(),
            &SystemProcessProbe,
            SystemTime::now(),
        )?;
        let snapshot = TelemetryStore::new(self.settings.cycle_record_file())?.snapshot();

        Ok(serde_json::to_string_pretty(&json!({
            "status": "ok",
            "version_file": self.settings.version_file.display().to_string(),
            "local_version": local_version,
            "lock": {
                "path": self.settings.lock_file.display().to_string(),
                "report": lock_status
            },
            "cycles": {
                "file": self.settings.cycle_record_file().display().to_string(),
                "total": snapshot.total_cycles,
                "updated": snapshot.updated_cycles,
                "up_to_date": snapshot.up_to_date_cycles,
                "failed": snapshot.failed_cycles,
                "last_success_at": snapshot.last_success_at,
                "last_update_at": snapshot.last_update_at
            },
            "last_cycle": snapshot.last_cycle
        }))
        .context("failed to encode status")?)
    }

    pub fn force_unlock_json(&self, confirm: bool) -> Result<String> {
        if !confirm {
            return Err(anyhow!(
                "unlock removes the lock regardless of its owner. Re-run with --confirm"
            ));
        }
        let store = FileLockStore::new(&self.settings.lock_file);
        let previous = lock::inspect(
            &store,
            self.settings.lock_timeout(),
            &SystemProcessProbe,
            SystemTime::now(),
        )?;
        let removed = lock::force_remove(&store)?;
        Ok(serde_json::to_string_pretty(&json!({
            "status": "ok",
            "lock_path": self.settings.lock_file.display().to_string(),
            "removed": removed,
            "previous": previous
        }))
        .context("failed to encode unlock result")?)
    }

    fn record_failure(&self, started_at: &str, err: &CycleError) {
        self.persist_record(CycleRecord {
            started_at: started_at.to_string(),
            finished_at: Utc::now().to_rfc3339(),
            pid: self.pid,
            status: "failed".to_string(),
            final_state: updater::CycleState::Failed.to_string(),
            channel: None,
            base_url: None,
            source_origin: None,
            local_version_before: None,
            remote_version: None,
            assets_installed: Vec::new(),
            skipped_lines: 0,
            permission_warnings: 0,
            error_kind: Some(err.kind().to_string()),
            error: Some(err.to_string()),
        });
    }

    /// Best effort: a cycle's outcome never depends on its record being saved.
    fn persist_record(&self, record: CycleRecord) {
        let path = self.settings.cycle_record_file();
        let result = TelemetryStore::new(&path).and_then(|mut store| store.record_cycle(record));
        if let Err(err) = result {
            warn!(path = %path.display(), error = %format!("{err:#}"), "failed saving cycle record");
        }
    }
}
