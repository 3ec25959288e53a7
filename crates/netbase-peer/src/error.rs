use netbase_transport::{ErrorKind, TransportError};

/// Errors from clients, servers and worker pools.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Socket-level failure, carrying one of the flat transport kinds.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Task submitted to a pool that is not running.
    #[error("worker pool is not running")]
    PoolStopped,

    /// A pool needs at least one worker.
    #[error("worker pool needs at least one worker")]
    NoWorkers,

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl PeerError {
    /// Transport error kind, if this is a socket-level failure.
    pub fn transport_kind(&self) -> Option<ErrorKind> {
        match self {
            PeerError::Transport(err) => Some(err.kind()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
