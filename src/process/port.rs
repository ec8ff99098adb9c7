//! Listening-socket detection.
//!
//! Reads the kernel's socket table instead of connecting, so a worker that is
//! still setting up its listener does not see spurious connections.

/// Whether something is listening on a TCP port.
pub trait PortProbe: Send + Sync {
    fn is_listening(&self, port: u16) -> bool;
}

/// [`PortProbe`] backed by the OS socket table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketTable;

/// TCP_LISTEN in `/proc/net/tcp*`.
#[cfg(any(target_os = "linux", test))]
const TCP_LISTEN: &str = "0A";

/// Scan a `/proc/net/tcp`-format table for a listener on `port`.
#[cfg(any(target_os = "linux", test))]
fn table_has_listener(table: &str, port: u16) -> bool {
    table.lines().skip(1).any(|line| {
        let mut fields = line.split_whitespace();
        let local = fields.nth(1);
        let state = fields.nth(1);
        match (local, state) {
            (Some(local), Some(state)) => {
                state == TCP_LISTEN
                    && local
                        .rsplit_once(':')
                        .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok())
                        == Some(port)
            }
            _ => false,
        }
    })
}

#[cfg(target_os = "linux")]
impl PortProbe for SocketTable {
    fn is_listening(&self, port: u16) -> bool {
        ["/proc/net/tcp", "/proc/net/tcp6"].iter().any(|path| {
            std::fs::read_to_string(path)
                .map(|table| table_has_listener(&table, port))
                .unwrap_or(false)
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl PortProbe for SocketTable {
    fn is_listening(&self, port: u16) -> bool {
        let output = std::process::Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-t"])
            .output();
        match output {
            Ok(out) => out.status.success() && !out.stdout.is_empty(),
            Err(e) => {
                log::debug!("lsof unavailable for port probe: {}", e);
                false
            }
        }
    }
}
