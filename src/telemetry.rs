use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::version::SourceOrigin;

const TELEMETRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub started_at: String,
    pub finished_at: String,
    pub pid: u32,
    pub status: String,
    pub final_state: String,
    pub channel: Option<String>,
    pub base_url: Option<String>,
    pub source_origin: Option<SourceOrigin>,
    pub local_version_before: Option<String>,
    pub remote_version: Option<String>,
    pub assets_installed: Vec<String>,
    pub skipped_lines: usize,
    pub permission_warnings: usize,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySnapshot {
    pub schema_version: u32,
    pub updated_at: String,
    pub total_cycles: u64,
    pub updated_cycles: u64,
    pub up_to_date_cycles: u64,
    pub failed_cycles: u64,
    pub last_success_at: Option<String>,
    pub last_update_at: Option<String>,
    pub last_cycle: Option<CycleRecord>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            schema_version: TELEMETRY_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            total_cycles: 0,
            updated_cycles: 0,
            up_to_date_cycles: 0,
            failed_cycles: 0,
            last_success_at: None,
            last_update_at: None,
            last_cycle: None,
        }
    }
}

pub struct TelemetryStore {
    path: PathBuf,
    snapshot: TelemetrySnapshot,
}

impl TelemetryStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = load_snapshot(&path)?;
        Ok(Self { path, snapshot })
    }

    pub fn record_cycle(&mut self, record: CycleRecord) -> Result<()> {
        self.snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
        self.snapshot.updated_at = Utc::now().to_rfc3339();
        self.snapshot.total_cycles = self.snapshot.total_cycles.saturating_add(1);

        match record.status.as_str() {
            "updated" => {
                self.snapshot.updated_cycles = self.snapshot.updated_cycles.saturating_add(1);
                self.snapshot.last_success_at = Some(record.finished_at.clone());
                self.snapshot.last_update_at = Some(record.finished_at.clone());
            }
            "up_to_date" => {
                self.snapshot.up_to_date_cycles =
                    self.snapshot.up_to_date_cycles.saturating_add(1);
                self.snapshot.last_success_at = Some(record.finished_at.clone());
            }
            _ => {
                self.snapshot.failed_cycles = self.snapshot.failed_cycles.saturating_add(1);
            }
        }

        self.snapshot.last_cycle = Some(record);
        self.persist()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }

    /// Per-process so two writers never share a temporary file.
    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension(format!("{}.tmp", process::id()))
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating state dir {}", parent.display()))?;
        }

        let payload = serde_json::to_string_pretty(&self.snapshot)
            .context("failed encoding cycle snapshot")?;
        let tmp_path = self.tmp_path();

        fs::write(&tmp_path, payload).with_context(|| {
            format!(
                "failed writing temporary cycle snapshot {}",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed moving cycle snapshot {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<TelemetrySnapshot> {
    if !path.exists() {
        return Ok(TelemetrySnapshot::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading cycle snapshot {}", path.display()))?;
    let mut snapshot: TelemetrySnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding cycle snapshot {}", path.display()))?;

    if snapshot.schema_version == 0 {
        snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
    }
    if snapshot.updated_at.trim().is_empty() {
        snapshot.updated_at = Utc::now().to_rfc3339();
    }

    Ok(snapshot)
}
