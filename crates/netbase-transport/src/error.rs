use std::io;

use crate::address::NetAddress;

/// Closed set of failure kinds an endpoint can record as its last error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    /// No failure recorded since the endpoint was configured.
    #[default]
    None,
    Open,
    Close,
    SetOptions,
    Bind,
    Listen,
    Accept,
    Connect,
    Transfer,
    Receive,
    Log,
}

impl ErrorKind {
    /// Fixed message written to the event log for this kind.
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::None => "OK",
            ErrorKind::Open => "Failed to open a socket",
            ErrorKind::Close => "Failed to close a socket",
            ErrorKind::SetOptions => "Failed to set the socket options",
            ErrorKind::Bind => "Failed to bind an IP address and port to the socket",
            ErrorKind::Listen => "Failed to create a connection queue on the socket",
            ErrorKind::Accept => "Failed to accept a connection",
            ErrorKind::Connect => "Failed to connect to the server",
            ErrorKind::Transfer => "Failed to send a data",
            ErrorKind::Receive => "Failed to receive a data",
            ErrorKind::Log => "Failed to open the log file",
        }
    }
}

/// Errors raised by endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket allocation failed.
    #[error("failed to open socket: {0}")]
    Open(#[source] io::Error),

    /// Closing a socket failed.
    #[error("failed to close socket: {0}")]
    Close(#[source] io::Error),

    /// Setting a socket option failed.
    #[error("failed to set socket options: {0}")]
    SetOptions(#[source] io::Error),

    /// Failed to bind to the specified address.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: NetAddress,
        source: io::Error,
    },

    /// Marking the socket as listening failed.
    #[error("failed to listen on socket: {0}")]
    Listen(#[source] io::Error),

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Failed to connect to the specified address.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: NetAddress,
        source: io::Error,
    },

    /// Sending a framed message failed.
    #[error("failed to send data: {0}")]
    Transfer(#[source] io::Error),

    /// Receiving a framed message failed.
    #[error("failed to receive data: {0}")]
    Receive(#[source] io::Error),

    /// Appending to the event log failed.
    #[error("failed to write event log: {0}")]
    Log(#[source] io::Error),

    /// The configured address could not be parsed.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {address}")]
    PathTooLong {
        address: String,
        len: usize,
        max: usize,
    },
}

impl TransportError {
    /// The taxonomy entry recorded as an endpoint's last error.
    ///
    /// Configuration failures happen before a socket exists and are
    /// reported as [`ErrorKind::Open`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Open(_)
            | TransportError::InvalidAddress { .. }
            | TransportError::PathTooLong { .. } => ErrorKind::Open,
            TransportError::Close(_) => ErrorKind::Close,
            TransportError::SetOptions(_) => ErrorKind::SetOptions,
            TransportError::Bind { .. } => ErrorKind::Bind,
            TransportError::Listen(_) => ErrorKind::Listen,
            TransportError::Accept(_) => ErrorKind::Accept,
            TransportError::Connect { .. } => ErrorKind::Connect,
            TransportError::Transfer(_) => ErrorKind::Transfer,
            TransportError::Receive(_) => ErrorKind::Receive,
            TransportError::Log(_) => ErrorKind::Log,
        }
    }

    /// Underlying OS error, when there is one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            TransportError::Open(source)
            | TransportError::Close(source)
            | TransportError::SetOptions(source)
            | TransportError::Listen(source)
            | TransportError::Accept(source)
            | TransportError::Transfer(source)
            | TransportError::Receive(source)
            | TransportError::Log(source)
            | TransportError::Bind { source, .. }
            | TransportError::Connect { source, .. } => Some(source),
            TransportError::InvalidAddress { .. } | TransportError::PathTooLong { .. } => None,
        }
    }

    /// True when the failure means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.io_error().map(io::Error::kind),
            Some(
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::WriteZero
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
