//! Clients, servers and worker pools built on netbase framing.
//!
//! - [`StreamClient`]: one connection to one peer, with liveness polling
//! - [`StreamServer`]: accept loop support, a bounded client registry and a
//!   FIFO handoff of accepted connections to worker tasks
//! - [`WorkerPool`]: the task executor the server dispatches to, with
//!   [`ThreadPool`] as the default
//!
//! Every endpoint here speaks the framing of [`netbase_frame::Framing`].

pub mod client;
pub mod connection;
pub mod error;
pub mod pool;
mod registry;
pub mod server;

pub use client::StreamClient;
pub use connection::ClientConnection;
pub use error::{PeerError, Result};
pub use pool::{Task, ThreadPool, WorkerPool};
pub use registry::{ClientHandle, ClientInfo};
pub use server::{ServerConfig, StreamServer, DEFAULT_MAX_CONNECTIONS};
