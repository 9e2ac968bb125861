//! Manifest parsing and per-asset installation.
//!
//! Manifest lines look like `<asset-filename> <logical-identifier>`. A bad
//! line is a [`SkippableLineError`]; a failed download is a
//! [`FatalAssetError`] and stops processing at once.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::log::UpdateLog;
use crate::transport::{Transport, TransportError};
use crate::version::{join_url, SourceLocation};

pub const MANIFEST_FILE_NAME: &str = "manifest.txt";
pub const SCRIPTS_SUBPATH: &str = "scripts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub line_no: usize,
    pub name: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineErrorReason {
    MissingIdentifier,
    InvalidAssetName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("manifest line {line_no} skipped ({reason:?}): {line}")]
pub struct SkippableLineError {
    pub line_no: usize,
    pub line: String,
    pub reason: LineErrorReason,
}

#[derive(Debug, Clone, Error)]
#[error("asset '{name}' failed: {source}")]
pub struct FatalAssetError {
    pub name: String,
    #[source]
    pub source: TransportError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub line_errors: Vec<SkippableLineError>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstalledAsset {
    pub name: String,
    pub identifier: String,
    pub path: PathBuf,
    pub executable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ManifestReport {
    pub installed: Vec<InstalledAsset>,
    pub skipped_lines: Vec<SkippableLineError>,
    pub permission_warnings: Vec<String>,
}

pub fn manifest_url(source: &SourceLocation) -> String {
    join_url(&source.base_url, MANIFEST_FILE_NAME)
}

/// The only way an asset URL is built: resolved base URL plus the fixed
/// scripts sub-path plus a validated file name.
pub fn asset_url(source: &SourceLocation, name: &str) -> String {
    join_url(&source.base_url, &format!("{}/{}", SCRIPTS_SUBPATH, name))
}

pub fn parse_manifest(text: &str) -> Manifest {
    let mut manifest = Manifest::default();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let name = fields.next().unwrap_or_default();
        let Some(identifier) = fields.next() else {
            manifest.line_errors.push(SkippableLineError {
                line_no,
                line: line.to_string(),
                reason: LineErrorReason::MissingIdentifier,
            });
            continue;
        };
        if !is_plain_file_name(name) {
            manifest.line_errors.push(SkippableLineError {
                line_no,
                line: line.to_string(),
                reason: LineErrorReason::InvalidAssetName,
            });
            continue;
        }

        manifest.entries.push(ManifestEntry {
            line_no,
            name: name.to_string(),
            identifier: identifier.to_string(),
        });
    }

    manifest
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.ends_with(".part")
}

/// Installs every entry in order. Stops at the first failed download.
pub fn apply_manifest<T: Transport + ?Sized>(
    transport: &T,
    source: &SourceLocation,
    scripts_dir: &Path,
    manifest: &Manifest,
    log: &mut UpdateLog,
) -> Result<ManifestReport, FatalAssetError> {
    let mut report = ManifestReport {
        skipped_lines: manifest.line_errors.clone(),
        ..ManifestReport::default()
    };
    for skipped in &manifest.line_errors {
        log.warning(format!(
            "Skipping manifest line {}: {} ({})",
            skipped.line_no,
            skipped.line,
            describe_reason(skipped.reason)
        ));
    }

    for entry in &manifest.entries {
        let url = asset_url(source, &entry.name);
        let destination = scripts_dir.join(&entry.name);

        if let Err(err) = transport.fetch(&url, &destination) {
            log.error(format!(
                "Failed to download {} ({}): {}",
                entry.name, entry.identifier, err
            ));
            return Err(FatalAssetError {
                name: entry.name.clone(),
                source: err,
            });
        }

        let executable = match make_executable(&destination) {
            Ok(()) => true,
            Err(err) => {
                let warning = format!(
                    "Could not mark {} executable: {}",
                    destination.display(),
                    err
                );
                log.warning(&warning);
                report.permission_warnings.push(warning);
                false
            }
        };
        debug!(asset = %entry.name, identifier = %entry.identifier, "asset installed");
        log.ok(format!("Updated {} ({})", entry.name, entry.identifier));

        report.installed.push(InstalledAsset {
            name: entry.name.clone(),
            identifier: entry.identifier.clone(),
            path: destination,
            executable,
        });
    }

    Ok(report)
}

fn describe_reason(reason: LineErrorReason) -> &'static str {
    match reason {
        LineErrorReason::MissingIdentifier => "missing identifier field",
        LineErrorReason::InvalidAssetName => "asset name must be a plain file name",
    }
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
pub fn make_executable(path: &Path) -> io::Result<()> {
    fs::metadata(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::{asset_url, manifest_url, parse_manifest, LineErrorReason};
    use crate::version::{SourceLocation, SourceOrigin};

    fn source() -> SourceLocation {
        SourceLocation {
            base_url: "https://raw.example/org/repo/main/".to_string(),
            channel: "main".to_string(),
            origin: SourceOrigin::Override,
        }
    }

    #[test]
    fn parse_skips_blank_and_comment_lines() {
        let manifest = parse_manifest(
            "# monitoring scripts\n\ncheck_cert.sh cert-expiry\n   # indented comment\ncheck_crl.sh crl-freshness\n",
        );
        let names = manifest
            .entries
            .iter()
            .map(|entry| (entry.name.as_str(), entry.identifier.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                ("check_cert.sh", "cert-expiry"),
                ("check_crl.sh", "crl-freshness")
            ]
        );
        assert!(manifest.line_errors.is_empty());
    }

    #[test]
    fn missing_identifier_is_a_line_error_not_a_failure() {
        let manifest = parse_manifest("lonely.sh\nchain.sh chain-validation\n");
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].line_no, 2);
        assert_eq!(manifest.line_errors.len(), 1);
        assert_eq!(manifest.line_errors[0].line_no, 1);
        assert_eq!(
            manifest.line_errors[0].reason,
            LineErrorReason::MissingIdentifier
        );
    }

    #[test]
    fn path_like_names_are_rejected() {
        let manifest = parse_manifest(
            "../etc/cron.d/evil x\nsub/dir.sh y\n.. z\nok.sh ok\nhttps://evil/x.sh w\n",
        );
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].name, "ok.sh");
        assert!(manifest
            .line_errors
            .iter()
            .all(|err| err.reason == LineErrorReason::InvalidAssetName));
        assert_eq!(manifest.line_errors.len(), 4);
    }

    #[test]
    fn extra_fields_and_crlf_are_tolerated() {
        let manifest = parse_manifest("iface.sh interface-discovery extra words\r\n");
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].identifier, "interface-discovery");
    }

    #[test]
    fn urls_are_built_from_resolved_base_only() {
        assert_eq!(
            manifest_url(&source()),
            "https://raw.example/org/repo/main/manifest.txt"
        );
        assert_eq!(
            asset_url(&source(), "check_cert.sh"),
            "https://raw.example/org/repo/main/scripts/check_cert.sh"
        );
    }

    #[test]
    fn empty_manifest_reports_empty() {
        assert!(parse_manifest("# nothing here\n\n").is_empty());
    }
}
