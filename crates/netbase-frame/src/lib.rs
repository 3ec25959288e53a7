//! Length-prefixed message framing over stream and datagram sockets.
//!
//! Every message is a 4-byte big-endian length followed by the payload.
//! On little-endian hosts each payload byte travels bit-reversed; see
//! [`netbase_transport::bitorder`].
//!
//! [`StreamTransport`] writes both parts in one send on a connected stream.
//! [`DatagramTransport`] sends them as two datagrams to a configured
//! destination. Both implement [`Framing`].

pub mod codec;
pub mod datagram;
pub mod framing;
pub mod stream;

pub use codec::{FrameConfig, DEFAULT_MAX_PAYLOAD, PREFIX_SIZE};
pub use datagram::DatagramTransport;
pub use framing::Framing;
pub use stream::StreamTransport;
