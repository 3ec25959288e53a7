use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
pub const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
pub const MAX_PATH_LEN: usize = 104;

/// Address family an endpoint communicates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Unix domain sockets; the address is a filesystem path.
    Local,
    /// IPv4 sockets; the address is a dotted quad.
    #[default]
    Remote,
}

/// A resolved socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetAddress {
    Inet(SocketAddrV4),
    /// Unix domain socket path. Unnamed peers carry an empty path.
    Unix(PathBuf),
}

impl NetAddress {
    /// Resolve a textual address for the given mode.
    ///
    /// The port is ignored for [`Mode::Local`].
    pub fn resolve(address: &str, port: u16, mode: Mode) -> Result<Self> {
        match mode {
            Mode::Remote => {
                let ip: Ipv4Addr =
                    address
                        .parse()
                        .map_err(|err: std::net::AddrParseError| {
                            TransportError::InvalidAddress {
                                address: address.to_string(),
                                reason: err.to_string(),
                            }
                        })?;
                Ok(NetAddress::Inet(SocketAddrV4::new(ip, port)))
            }
            Mode::Local => {
                if address.is_empty() {
                    return Err(TransportError::InvalidAddress {
                        address: address.to_string(),
                        reason: "unix socket path must not be empty".to_string(),
                    });
                }
                if address.len() >= MAX_PATH_LEN {
                    return Err(TransportError::PathTooLong {
                        address: address.to_string(),
                        len: address.len(),
                        max: MAX_PATH_LEN,
                    });
                }
                Ok(NetAddress::Unix(PathBuf::from(address)))
            }
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            NetAddress::Inet(_) => Mode::Remote,
            NetAddress::Unix(_) => Mode::Local,
        }
    }

    /// Host part: the dotted quad, or the socket path.
    pub fn host(&self) -> String {
        match self {
            NetAddress::Inet(addr) => addr.ip().to_string(),
            NetAddress::Unix(path) => path.display().to_string(),
        }
    }

    /// Port number; always zero for unix domain addresses.
    pub fn port(&self) -> u16 {
        match self {
            NetAddress::Inet(addr) => addr.port(),
            NetAddress::Unix(_) => 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            NetAddress::Inet(_) => None,
            NetAddress::Unix(path) => Some(path),
        }
    }

    /// Audit line describing a connection on this address.
    pub fn info(&self, fd: Option<i32>) -> String {
        let socket = fd.unwrap_or(-1);
        format!(
            "IP address: {}   Port: {}   Socket: {}",
            self.host(),
            self.port(),
            socket
        )
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddress::Inet(addr) => write!(f, "{addr}"),
            NetAddress::Unix(path) if path.as_os_str().is_empty() => write!(f, "unix:<unnamed>"),
            NetAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddrV4> for NetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        NetAddress::Inet(addr)
    }
}

/// Process-boundary configuration of a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Dotted-quad IPv4 address or unix socket path.
    pub address: String,
    pub port: u16,
    pub mode: Mode,
    /// Event log target. `None` disables the event log.
    pub log_file: Option<PathBuf>,
}

impl EndpointConfig {
    pub fn new(address: impl Into<String>, port: u16, mode: Mode) -> Self {
        Self {
            address: address.into(),
            port,
            mode,
            log_file: None,
        }
    }

    /// Append lifecycle events to `path`.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn resolve(&self) -> Result<NetAddress> {
        NetAddress::resolve(&self.address, self.port, self.mode)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), 0, Mode::Remote)
    }
}
