//! Socket endpoint core.
//!
//! Owns one OS socket per endpoint and everything shared by the transports
//! built on top of it:
//! - IPv4 and unix domain addressing
//! - the flat error taxonomy every operation reports through
//! - the timestamped event log
//! - payload bit-order normalization
//!
//! This is the lowest layer of netbase. Framing lives in `netbase-frame`,
//! clients and servers in `netbase-peer`.

#[cfg(not(unix))]
compile_error!("netbase requires a Unix platform");

pub mod address;
pub mod bitorder;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod socket;

pub use address::{EndpointConfig, Mode, NetAddress, MAX_PATH_LEN};
pub use endpoint::Endpoint;
pub use error::{ErrorKind, Result, TransportError};
pub use event::{EventKind, EventLog, FileSink, LogSink, MemorySink};
pub use socket::{Peek, Socket, SocketKind};
