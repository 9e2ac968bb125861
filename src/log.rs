//! Append-only operator log.
//!
//! The `run` command is silent on the terminal, so this file is the only
//! place an operator can see what a cycle did. Every line has the shape
//! `[YYYY-MM-DD HH:MM:SS] [SEVERITY] message` with a UTC timestamp.

use std::fmt::{Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn marker(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.marker())
    }
}

#[derive(Debug)]
pub struct UpdateLog {
    path: Option<PathBuf>,
    file: Option<File>,
    write_failed: bool,
}

impl UpdateLog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: Some(path),
            file: Some(file),
            write_failed: false,
        })
    }

    /// A log that only forwards to tracing. Used by read-only commands.
    pub fn detached() -> Self {
        Self {
            path: None,
            file: None,
            write_failed: false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ok(&mut self, message: impl AsRef<str>) {
        self.record(Severity::Ok, message.as_ref());
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.record(Severity::Info, message.as_ref());
    }

    pub fn warning(&mut self, message: impl AsRef<str>) {
        self.record(Severity::Warning, message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.record(Severity::Error, message.as_ref());
    }

    pub fn record(&mut self, severity: Severity, message: &str) {
        match severity {
            Severity::Ok | Severity::Info => info!(severity = %severity, "{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }

        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = format_line(Utc::now(), severity, message);
        if let Err(err) = file.write_all(line.as_bytes()) {
            // Report the first failure only; a full disk would otherwise flood stderr.
            if !self.write_failed {
                self.write_failed = true;
                let path = self
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                warn!(path = %path, error = %err, "failed appending to update log");
            }
        }
    }
}

pub fn format_line(at: DateTime<Utc>, severity: Severity, message: &str) -> String {
    let single_line = message.replace(['\r', '\n'], " ");
    format!(
        "[{}] [{}] {}\n",
        at.format("%Y-%m-%d %H:%M:%S"),
        severity.marker(),
        single_line.trim_end()
    )
}

/// Reads the log back; missing file reads as empty.
pub fn read_log(path: impl AsRef<Path>) -> io::Result<String> {
    match fs::read_to_string(path.as_ref()) {
        Ok(raw) => Ok(raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}
