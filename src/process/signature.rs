//! Worker identity as seen in the process table.

use std::path::Path;

use crate::config::WorkerConfig;

/// Structural description of a worker command line: the entry point's file
/// name plus the port argument it was launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSignature {
    pub executable: String,
    pub port_flag: String,
    pub port: u16,
}

impl WorkerSignature {
    pub fn new(executable: impl Into<String>, port_flag: impl Into<String>, port: u16) -> Self {
        Self {
            executable: executable.into(),
            port_flag: port_flag.into(),
            port,
        }
    }

    pub fn from_config(worker: &WorkerConfig) -> Self {
        let executable = Path::new(&worker.script)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| worker.script.clone());
        Self::new(executable, worker.port_flag.clone(), worker.port)
    }

    /// Whether `argv` belongs to a worker bound to this signature's port.
    pub fn matches<S: AsRef<str>>(&self, argv: &[S]) -> bool {
        self.has_executable(argv) && self.port_argument(argv) == Some(self.port)
    }

    fn has_executable<S: AsRef<str>>(&self, argv: &[S]) -> bool {
        argv.iter().any(|arg| {
            Path::new(arg.as_ref())
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == self.executable)
        })
    }

    /// Port passed as `--flag N` or `--flag=N`. The last occurrence wins, as
    /// with most argument parsers.
    fn port_argument<S: AsRef<str>>(&self, argv: &[S]) -> Option<u16> {
        let prefix = format!("{}=", self.port_flag);
        let mut found = None;
        let mut args = argv.iter().map(AsRef::as_ref);
        while let Some(arg) = args.next() {
            if arg == self.port_flag {
                found = args.next().and_then(|value| value.parse().ok());
            } else if let Some(value) = arg.strip_prefix(&prefix) {
                found = value.parse().ok();
            }
        }
        found
    }
}
