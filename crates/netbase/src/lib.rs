//! Framed stream and datagram networking endpoints over OS sockets.
//!
//! netbase wraps IPv4 and unix domain sockets in endpoints that exchange
//! length-prefixed messages, report every lifecycle step to an optional
//! event log, and fail through one flat error taxonomy.
//!
//! # Crate Structure
//!
//! - [`transport`]: endpoint core, addresses, sockets, errors, event log
//! - [`frame`]: wire codec plus stream and datagram framing
//! - [`peer`]: stream client, multi-client server and worker pool (behind
//!   the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use netbase_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use netbase_frame::*;
}

/// Re-export client and server types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use netbase_peer::*;
}
