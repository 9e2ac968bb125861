use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{SourceSettings, DEFAULT_CHANNEL};
use crate::transport::{ErrorClass, Transport, TransportError};

pub const VERSION_FILE_NAME: &str = "VERSION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    Override,
    Inferred,
    Default,
}

/// Where this cycle pulls its version, manifest and assets from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub base_url: String,
    pub channel: String,
    pub origin: SourceOrigin,
}

impl SourceLocation {
    pub fn version_url(&self) -> String {
        join_url(&self.base_url, VERSION_FILE_NAME)
    }
}

pub fn resolve_source(settings: &SourceSettings) -> SourceLocation {
    let channel = non_empty(settings.channel.as_deref())
        .unwrap_or(DEFAULT_CHANNEL)
        .to_string();

    if let Some(base_url) = non_empty(settings.base_url.as_deref()) {
        return SourceLocation {
            base_url: base_url.trim_end_matches('/').to_string(),
            channel,
            origin: SourceOrigin::Override,
        };
    }

    if let Some(base_url) =
        non_empty(settings.self_url.as_deref()).and_then(|url| infer_base_url(url, &channel))
    {
        return SourceLocation {
            base_url,
            channel,
            origin: SourceOrigin::Inferred,
        };
    }

    SourceLocation {
        base_url: format!(
            "{}/{}",
            settings.default_repository.trim().trim_end_matches('/'),
            channel
        ),
        channel,
        origin: SourceOrigin::Default,
    }
}

/// Derives `<root>/<channel>` from the URL the updater was downloaded from,
/// which has the shape `<root>/<any channel>/<file>`.
pub fn infer_base_url(self_url: &str, channel: &str) -> Option<String> {
    let (scheme, rest) = self_url.trim().split_once("://")?;
    if !matches!(scheme.to_ascii_lowercase().as_str(), "http" | "https") {
        return None;
    }
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);

    let mut segments = rest.split('/').collect::<Vec<&str>>();
    // host, channel, file
    if segments.len() < 3 || segments[0].is_empty() {
        return None;
    }
    let file = segments.pop()?;
    let previous_channel = segments.pop()?;
    if file.is_empty() || previous_channel.is_empty() {
        return None;
    }

    Some(format!("{}://{}/{}", scheme, segments.join("/"), channel))
}

pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Downloads the remote version file to `scratch` and returns its trimmed content.
pub fn fetch_remote_version<T: Transport + ?Sized>(
    transport: &T,
    source: &SourceLocation,
    scratch: &Path,
) -> Result<String, TransportError> {
    let url = source.version_url();
    let report = transport.fetch(&url, scratch)?;
    let raw = fs::read_to_string(scratch);
    discard_scratch(scratch);

    let raw = raw.map_err(|err| {
        TransportError::new(
            &url,
            report.attempts,
            ErrorClass::Permanent,
            format!("downloaded version file is unreadable: {}", err),
        )
    })?;
    let version = raw.trim().to_string();
    if version.is_empty() {
        return Err(TransportError::new(
            &url,
            report.attempts,
            ErrorClass::Permanent,
            "remote version file is empty",
        ));
    }
    debug!(url = %url, version = %version, "fetched remote version");
    Ok(version)
}

pub fn read_local_version(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let trimmed = raw.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Exact, case-sensitive match; an absent local marker never matches.
pub fn versions_match(local: Option<&str>, remote: &str) -> bool {
    match local.map(str::trim) {
        Some(local) if !local.is_empty() => local == remote.trim(),
        _ => false,
    }
}

/// Writes the marker through a temporary sibling so readers never see a
/// truncated value.
pub fn commit_version(path: &Path, version: &str) -> io::Result<()> {
    let tmp = tmp_sibling(path);
    fs::write(&tmp, format!("{}\n", version.trim()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("version");
    path.with_file_name(format!("{file_name}.tmp"))
}

fn discard_scratch(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed removing scratch file");
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
