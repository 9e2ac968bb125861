use std::ffi::OsStr;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::TransportSettings;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Extra time curl gets past its own `--max-time` before we kill it.
const CURL_KILL_GRACE: Duration = Duration::from_secs(5);

/// Fetch one URL into one local file.
///
/// Implementations report failure as a value; the caller decides whether a
/// failed fetch is fatal.
pub trait Transport {
    fn fetch(&self, url: &str, destination: &Path) -> Result<FetchReport, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    pub attempts: u32,
    pub latency_ms: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{url}: {class} error after {attempts} attempt(s): {message}")]
pub struct TransportError {
    pub url: String,
    pub attempts: u32,
    pub class: ErrorClass,
    pub message: String,
}

impl TransportError {
    pub fn new(
        url: impl Into<String>,
        attempts: u32,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            attempts,
            class,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("no download tool available (tried {})", .tried.join(", "))]
pub struct ToolUnavailable {
    pub tried: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Curl,
    Wget,
}

impl Tool {
    pub const PREFERENCE: [Tool; 2] = [Tool::Curl, Tool::Wget];

    pub fn program(self) -> &'static str {
        match self {
            Self::Curl => "curl",
            Self::Wget => "wget",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "curl" => Some(Self::Curl),
            "wget" => Some(Self::Wget),
            _ => None,
        }
    }
}

impl Display for Tool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// Transport backed by an external download tool chosen once per process.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    tool: Tool,
    program: PathBuf,
    settings: TransportSettings,
}

impl CommandTransport {
    pub fn select(settings: &TransportSettings) -> Result<Self, ToolUnavailable> {
        Self::select_with(settings, |program| which::which(program).ok())
    }

    /// Selection with an injectable `PATH` lookup.
    pub fn select_with<F>(settings: &TransportSettings, lookup: F) -> Result<Self, ToolUnavailable>
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        let candidates = match settings.tool.as_deref() {
            Some(name) => match Tool::from_name(name) {
                Some(tool) => vec![tool],
                None => {
                    return Err(ToolUnavailable {
                        tried: vec![name.to_string()],
                    })
                }
            },
            None => Tool::PREFERENCE.to_vec(),
        };

        for tool in &candidates {
            if let Some(program) = lookup(tool.program()) {
                debug!(tool = %tool, program = %program.display(), "selected download tool");
                return Ok(Self::with_program(*tool, program, settings.clone()));
            }
        }

        Err(ToolUnavailable {
            tried: candidates
                .iter()
                .map(|tool| tool.program().to_string())
                .collect(),
        })
    }

    pub fn with_program(tool: Tool, program: impl Into<PathBuf>, settings: TransportSettings) -> Self {
        Self {
            tool,
            program: program.into(),
            settings,
        }
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    fn build_command(&self, url: &str, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        match self.tool {
            Tool::Curl => {
                command
                    .arg("-sS")
                    .arg("--fail")
                    .arg("--location")
                    .arg("--connect-timeout")
                    .arg(self.settings.connect_timeout_secs.to_string())
                    .arg("--max-time")
                    .arg(self.settings.max_time_secs.to_string())
                    .arg("-o")
                    .arg(output)
                    .arg(url);
            }
            Tool::Wget => {
                command
                    .arg("--no-verbose")
                    .arg("--tries=1")
                    .arg(format!(
                        "--connect-timeout={}",
                        self.settings.connect_timeout_secs
                    ))
                    .arg(format!("--read-timeout={}", self.settings.max_time_secs))
                    .arg("-O")
                    .arg(output)
                    .arg(url);
            }
        }
        command
    }

    /// Wall-clock cap for one attempt. wget only has idle timeouts, so the
    /// configured total is enforced here; curl enforces it itself.
    fn attempt_time_limit(&self) -> Duration {
        let total = Duration::from_secs(self.settings.max_time_secs.max(1));
        match self.tool {
            Tool::Curl => total + CURL_KILL_GRACE,
            Tool::Wget => total,
        }
    }

    fn fetch_once(&self, url: &str, output: &Path) -> Result<(), AttemptError> {
        let child = self
            .build_command(url, output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AttemptError {
                class: ErrorClass::Transient,
                message: format!("failed to execute {}: {}", self.tool, err),
            })?;

        let limit = self.attempt_time_limit();
        let result = match wait_with_deadline(child, limit) {
            Ok(Some(result)) => result,
            Ok(None) => {
                return Err(AttemptError {
                    class: ErrorClass::Transient,
                    message: format!(
                        "{} exceeded the {}s time limit and was killed",
                        self.tool,
                        limit.as_secs()
                    ),
                })
            }
            Err(err) => {
                return Err(AttemptError {
                    class: ErrorClass::Transient,
                    message: format!("failed waiting for {}: {}", self.tool, err),
                })
            }
        };

        if result.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&result.stderr);
        Err(match self.tool {
            Tool::Curl => classify_curl_failure(result.status.code(), &stderr),
            Tool::Wget => classify_wget_failure(result.status.code(), &stderr),
        })
    }
}

/// Waits for `child`, killing it once `limit` has passed. `Ok(None)` means it
/// was killed.
fn wait_with_deadline(mut child: Child, limit: Duration) -> io::Result<Option<Output>> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return child.wait_with_output().map(Some),
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        }

        if started.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

impl Transport for CommandTransport {
    #[instrument(name = "transport.fetch", skip(self, destination), fields(tool = %self.tool))]
    fn fetch(&self, url: &str, destination: &Path) -> Result<FetchReport, TransportError> {
        let started = Instant::now();
        let part = partial_path(destination);
        let total_attempts = self.settings.retries.saturating_add(1);
        let mut last_error: Option<AttemptError> = None;

        for attempt_no in 1..=total_attempts {
            match self.fetch_once(url, &part) {
                Ok(()) => {
                    if let Err(err) = fs::rename(&part, destination) {
                        remove_partial(&part);
                        return Err(TransportError::new(
                            url,
                            attempt_no,
                            ErrorClass::Permanent,
                            format!(
                                "failed moving download into place {}: {}",
                                destination.display(),
                                err
                            ),
                        ));
                    }
                    let bytes = fs::metadata(destination).map(|m| m.len()).unwrap_or(0);
                    let latency_ms = elapsed_ms(started);
                    debug!(
                        attempt = attempt_no,
                        latency_ms = latency_ms,
                        bytes = bytes,
                        "fetch succeeded"
                    );
                    return Ok(FetchReport {
                        attempts: attempt_no,
                        latency_ms,
                        bytes,
                    });
                }
                Err(err) => {
                    remove_partial(&part);
                    let is_last_attempt = attempt_no >= total_attempts;
                    if err.class == ErrorClass::Transient && !is_last_attempt {
                        warn!(
                            attempt = attempt_no,
                            total_attempts = total_attempts,
                            delay_secs = self.settings.retry_delay_secs,
                            error = %err,
                            "transient fetch failure, retrying"
                        );
                        last_error = Some(err);
                        thread::sleep(self.settings.retry_delay());
                        continue;
                    }
                    return Err(TransportError::new(url, attempt_no, err.class, err.message));
                }
            }
        }

        let fallback = last_error
            .map(|err| err.message)
            .unwrap_or_else(|| "unknown transport failure".to_string());
        Err(TransportError::new(
            url,
            total_attempts,
            ErrorClass::Transient,
            fallback,
        ))
    }
}

#[derive(Debug, Clone)]
struct AttemptError {
    class: ErrorClass,
    message: String,
}

impl Display for AttemptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.class, self.message)
    }
}

pub fn partial_path(destination: &Path) -> PathBuf {
    let file_name = destination
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("download");
    destination.with_file_name(format!("{file_name}.part"))
}

fn remove_partial(part: &Path) {
    if let Err(err) = fs::remove_file(part) {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %part.display(), error = %err, "failed removing partial download");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn classify_curl_failure(code: Option<i32>, stderr: &str) -> AttemptError {
    let http_status = parse_status_after(stderr, "returned error:");
    let class = match code {
        Some(22) => classify_http_status(http_status),
        Some(code) if is_transient_curl_code(code) => Some(ErrorClass::Transient),
        Some(_) => Some(ErrorClass::Permanent),
        None => Some(ErrorClass::Transient),
    }
    .unwrap_or(ErrorClass::Permanent);

    AttemptError {
        class,
        message: describe_failure("curl", code, http_status, stderr),
    }
}

fn classify_wget_failure(code: Option<i32>, stderr: &str) -> AttemptError {
    let http_status = parse_status_after(stderr, "ERROR");
    let class = match code {
        Some(4) => Some(ErrorClass::Transient),
        Some(8) => classify_http_status(http_status),
        Some(_) => Some(ErrorClass::Permanent),
        None => Some(ErrorClass::Transient),
    }
    .unwrap_or(ErrorClass::Permanent);

    AttemptError {
        class,
        message: describe_failure("wget", code, http_status, stderr),
    }
}

fn describe_failure(tool: &str, code: Option<i32>, http_status: Option<u16>, stderr: &str) -> String {
    let mut details = Vec::new();
    match code {
        Some(code) => details.push(format!("{}_code={}", tool, code)),
        None => details.push(format!("{} terminated by signal", tool)),
    }
    if let Some(status) = http_status {
        details.push(format!("http_status={}", status));
    }
    if !stderr.trim().is_empty() {
        details.push(format!("stderr={}", stderr.trim()));
    }
    details.join("; ")
}

fn parse_status_after(text: &str, marker: &str) -> Option<u16> {
    let idx = text.find(marker)?;
    let rest = &text[idx + marker.len()..];
    let start = rest.find(|c: char| c.is_ascii_digit())?;
    let digits = rest[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    if digits.len() != 3 {
        return None;
    }
    digits.parse::<u16>().ok()
}

fn is_transient_curl_code(code: i32) -> bool {
    matches!(code, 5 | 6 | 7 | 18 | 28 | 35 | 47 | 52 | 55 | 56)
}

fn classify_http_status(status: Option<u16>) -> Option<ErrorClass> {
    let status = status?;
    if matches!(status, 408 | 425 | 429) || status >= 500 {
        return Some(ErrorClass::Transient);
    }
    if (400..500).contains(&status) {
        return Some(ErrorClass::Permanent);
    }
    None
}
