use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

const ENV_FILE_ENV: &str = "FLEET_SYNC_ENV_FILE";

pub const DEFAULT_INSTALL_DIR: &str = "/opt/fleet-sync";
pub const DEFAULT_REPOSITORY: &str = "https://raw.githubusercontent.com/fleet-sync/monitoring-agent";
pub const DEFAULT_CHANNEL: &str = "main";

#[derive(Debug, Clone)]
pub struct Settings {
    pub install_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub version_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_file: PathBuf,
    pub state_dir: PathBuf,
    pub source: SourceSettings,
    pub transport: TransportSettings,
    pub lock_timeout_secs: u64,
}

/// Inputs for resolving where the remote assets live.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub channel: Option<String>,
    pub base_url: Option<String>,
    pub self_url: Option<String>,
    pub default_repository: String,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub tool: Option<String>,
    pub connect_timeout_secs: u64,
    pub max_time_secs: u64,
    pub retries: u32,
    pub retry_delay_secs: u64,
}

impl TransportSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            tool: None,
            connect_timeout_secs: 10,
            max_time_secs: 60,
            retries: 3,
            retry_delay_secs: 2,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let install_dir = read_path_env("FLEET_SYNC_INSTALL_DIR")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_DIR));
        let mut settings = Self::rooted_at(install_dir);

        if let Some(path) = read_path_env("FLEET_SYNC_SCRIPTS_DIR") {
            settings.scripts_dir = path;
        }
        if let Some(path) = read_path_env("FLEET_SYNC_VERSION_FILE") {
            settings.version_file = path;
        }
        if let Some(path) = read_path_env("FLEET_SYNC_LOCK_FILE") {
            settings.lock_file = path;
        }
        if let Some(path) = read_path_env("FLEET_SYNC_LOG_FILE") {
            settings.log_file = path;
        }
        if let Some(path) = read_path_env("FLEET_SYNC_STATE_DIR") {
            settings.state_dir = path;
        }

        settings.source = SourceSettings {
            channel: read_non_empty_env("FLEET_SYNC_BRANCH"),
            base_url: read_non_empty_env("FLEET_SYNC_BASE_URL"),
            self_url: read_non_empty_env("FLEET_SYNC_SELF_URL"),
            default_repository: read_non_empty_env("FLEET_SYNC_DEFAULT_REPO")
                .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string()),
        };

        let defaults = TransportSettings::default();
        settings.transport = TransportSettings {
            tool: read_non_empty_env("FLEET_SYNC_TRANSPORT").map(|value| value.to_lowercase()),
            connect_timeout_secs: read_u64_env(
                "FLEET_SYNC_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            ),
            max_time_secs: read_u64_env("FLEET_SYNC_MAX_TIME_SECS", defaults.max_time_secs),
            retries: read_u32_env("FLEET_SYNC_RETRIES", defaults.retries),
            retry_delay_secs: read_u64_env(
                "FLEET_SYNC_RETRY_DELAY_SECS",
                defaults.retry_delay_secs,
            ),
        };
        settings.lock_timeout_secs = read_u64_env("FLEET_SYNC_LOCK_TIMEOUT_SECS", 300);

        Ok(settings)
    }

    /// Settings with every path derived from `install_dir` and no overrides.
    pub fn rooted_at(install_dir: impl Into<PathBuf>) -> Self {
        let install_dir = install_dir.into();
        Self {
            scripts_dir: install_dir.join("scripts"),
            version_file: install_dir.join("VERSION"),
            lock_file: install_dir.join("run").join("update.lock"),
            log_file: install_dir.join("logs").join("update.log"),
            state_dir: install_dir.join("state"),
            install_dir,
            source: SourceSettings {
                channel: None,
                base_url: None,
                self_url: None,
                default_repository: DEFAULT_REPOSITORY.to_string(),
            },
            transport: TransportSettings::default(),
            lock_timeout_secs: 300,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn cycle_record_file(&self) -> PathBuf {
        self.state_dir.join("last-cycle.json")
    }

    /// Directories that must exist before a cycle can write anything.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.scripts_dir.clone(), self.state_dir.clone()];
        for file in [&self.version_file, &self.lock_file, &self.log_file] {
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                dirs.push(parent.to_path_buf());
            }
        }
        dirs.sort();
        dirs.dedup();
        dirs
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();
        if self.transport.connect_timeout_secs == 0 {
            warnings.push("FLEET_SYNC_CONNECT_TIMEOUT_SECS should be > 0".to_string());
        }
        if self.transport.max_time_secs == 0 {
            warnings.push("FLEET_SYNC_MAX_TIME_SECS should be > 0".to_string());
        }
        if self.transport.max_time_secs < self.transport.connect_timeout_secs {
            warnings.push(
                "FLEET_SYNC_MAX_TIME_SECS should be >= FLEET_SYNC_CONNECT_TIMEOUT_SECS"
                    .to_string(),
            );
        }
        if self.lock_timeout_secs == 0 {
            warnings.push(
                "FLEET_SYNC_LOCK_TIMEOUT_SECS is 0; every existing lock will be treated as stale"
                    .to_string(),
            );
        }
        let worst_case_fetch_secs = self
            .transport
            .max_time_secs
            .saturating_add(self.transport.retry_delay_secs)
            .saturating_mul(u64::from(self.transport.retries) + 1);
        if self.lock_timeout_secs > 0 && worst_case_fetch_secs >= self.lock_timeout_secs {
            warnings.push(format!(
                "a single fetch can take up to {}s, at or above FLEET_SYNC_LOCK_TIMEOUT_SECS={}; a slow cycle may be reclaimed while running",
                worst_case_fetch_secs, self.lock_timeout_secs
            ));
        }
        if let Some(tool) = self.transport.tool.as_deref() {
            if !matches!(tool, "curl" | "wget") {
                warnings.push(format!(
                    "FLEET_SYNC_TRANSPORT='{}' is not recognised; expected curl or wget",
                    tool
                ));
            }
        }
        for (key, value) in [
            ("FLEET_SYNC_BASE_URL", self.source.base_url.as_deref()),
            (
                "FLEET_SYNC_DEFAULT_REPO",
                Some(self.source.default_repository.as_str()),
            ),
        ] {
            if let Some(url) = value {
                if !url.starts_with("https://") {
                    warnings.push(format!(
                        "{} does not use https; downloads are not integrity checked",
                        key
                    ));
                }
            }
        }

        DoctorReport {
            install_dir: self.install_dir.clone(),
            scripts_dir: self.scripts_dir.clone(),
            version_file: self.version_file.clone(),
            lock_file: self.lock_file.clone(),
            log_file: self.log_file.clone(),
            state_dir: self.state_dir.clone(),
            channel_override: self.source.channel.clone(),
            base_url_override: self.source.base_url.clone(),
            self_url: self.source.self_url.clone(),
            default_repository: self.source.default_repository.clone(),
            transport_tool: self.transport.tool.clone(),
            connect_timeout_secs: self.transport.connect_timeout_secs,
            max_time_secs: self.transport.max_time_secs,
            retries: self.transport.retries,
            retry_delay_secs: self.transport.retry_delay_secs,
            lock_timeout_secs: self.lock_timeout_secs,
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub install_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub version_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_file: PathBuf,
    pub state_dir: PathBuf,
    pub channel_override: Option<String>,
    pub base_url_override: Option<String>,
    pub self_url: Option<String>,
    pub default_repository: String,
    pub transport_tool: Option<String>,
    pub connect_timeout_secs: u64,
    pub max_time_secs: u64,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub lock_timeout_secs: u64,
    pub warnings: Vec<String>,
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_path_env(key: &str) -> Option<PathBuf> {
    read_non_empty_env(key).map(PathBuf::from)
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_u32_env(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
