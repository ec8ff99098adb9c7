//! Supervisor error types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

/// Supervisor error carrying a kind and a small key/value payload.
#[derive(Debug)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A worker instance is already running
    AlreadyRunning,
    /// No worker instance is running
    NotRunning,
    /// The configured port is bound by an unrelated process
    PortInUse,
    /// The worker could not be spawned or died during startup
    LaunchFailed,
    /// The health endpoint could not be reached
    HealthUnreachable,
    /// The worker ignored the graceful termination signal
    GracefulTimeout,
    /// The worker survived forced termination
    ForcedTerminationFailed,
    /// A stray worker process could not be removed
    OrphanCleanupFailed,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Process table or signal error
    Process,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::AlreadyRunning => 1001,
            Self::NotRunning => 1002,
            Self::PortInUse => 1003,
            Self::LaunchFailed => 1004,
            Self::HealthUnreachable => 2001,
            Self::GracefulTimeout => 2002,
            Self::ForcedTerminationFailed => 2003,
            Self::OrphanCleanupFailed => 2004,
            Self::Config => 3001,
            Self::Io => 3002,
            Self::Process => 3003,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn already_running(pid: u32) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            BTreeMap::from([("pid".to_string(), pid.to_string())]),
        )
    }

    pub fn not_running() -> Self {
        Self::new(ErrorKind::NotRunning, BTreeMap::new())
    }

    pub fn port_in_use(port: u16) -> Self {
        Self::new(
            ErrorKind::PortInUse,
            BTreeMap::from([("port".to_string(), port.to_string())]),
        )
    }

    pub fn launch_failed(detail: impl Into<String>, log_file: &Path) -> Self {
        Self::new(
            ErrorKind::LaunchFailed,
            BTreeMap::from([
                ("detail".to_string(), detail.into()),
                ("log".to_string(), log_file.display().to_string()),
            ]),
        )
    }

    pub fn health_unreachable(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::HealthUnreachable,
            BTreeMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn graceful_timeout(pid: u32) -> Self {
        Self::new(
            ErrorKind::GracefulTimeout,
            BTreeMap::from([("pid".to_string(), pid.to_string())]),
        )
    }

    pub fn forced_termination_failed(pid: u32) -> Self {
        Self::new(
            ErrorKind::ForcedTerminationFailed,
            BTreeMap::from([("pid".to_string(), pid.to_string())]),
        )
    }

    pub fn orphan_cleanup_failed(pid: u32, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::OrphanCleanupFailed,
            BTreeMap::from([
                ("pid".to_string(), pid.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    /// Operator-facing follow-up for errors that have one.
    pub fn hint(&self) -> Option<String> {
        match self.kind {
            ErrorKind::PortInUse => Some(format!(
                "another process is listening on port {}; stop it or change worker.port",
                self.get("port").unwrap_or("?")
            )),
            ErrorKind::LaunchFailed => self.get("log").map(|log| format!("inspect {log}")),
            ErrorKind::ForcedTerminationFailed => Some(format!(
                "pid {} is still alive after SIGKILL; it may be stuck in uninterruptible I/O",
                self.get("pid").unwrap_or("?")
            )),
            _ => None,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::other(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::other(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
