use std::io;

use bytes::{BufMut, BytesMut};
use netbase_transport::bitorder;

/// Length prefix: 4 bytes, network byte order.
pub const PREFIX_SIZE: usize = 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Configuration for framed transfers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest payload accepted in either direction. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameConfig {
    /// Reject payload sizes above the configured limit.
    pub fn check(&self, size: usize) -> io::Result<()> {
        if size > self.max_payload_size || size > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "payload too large ({size} bytes, max {})",
                    self.max_payload_size.min(u32::MAX as usize)
                ),
            ));
        }
        Ok(())
    }
}

/// Encode the length prefix for a payload of `len` bytes.
pub fn encode_prefix(len: usize) -> io::Result<[u8; PREFIX_SIZE]> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload too large ({len} bytes, max {})", u32::MAX),
        )
    })?;
    Ok(len.to_be_bytes())
}

/// Decode a length prefix into host order.
pub fn decode_prefix(prefix: [u8; PREFIX_SIZE]) -> u32 {
    u32::from_be_bytes(prefix)
}

/// Append the wire form of `payload` (bit-order normalized) to `dst`.
pub fn encode_payload(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len());
    dst.extend(payload.iter().map(|b| bitorder::normalize_byte(*b)));
}

/// Restore a received payload to host bit order in place.
pub fn decode_payload(payload: &mut [u8]) {
    bitorder::normalize(payload);
}

/// Encode a complete wire message: prefix followed by payload.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬──────────────────────────────────┐
/// │ Length (4B BE)   │ Payload (Length bytes)           │
/// │                  │ bit-reversed per byte on LE hosts│
/// └──────────────────┴──────────────────────────────────┘
/// ```
pub fn encode_message(payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
    let prefix = encode_prefix(payload.len())?;
    dst.reserve(PREFIX_SIZE + payload.len());
    dst.put_slice(&prefix);
    encode_payload(payload, dst);
    Ok(())
}
