use netbase_transport::Result;

/// Length-prefixed message exchange over some socket.
///
/// Implemented by [`StreamTransport`](crate::StreamTransport),
/// [`DatagramTransport`](crate::DatagramTransport) and the server-side
/// client connections. `Ok(false)` / `Ok(None)` mean the transport was not in
/// a state to transfer (not running, no destination, empty payload) and
/// nothing touched the wire.
pub trait Framing {
    /// Send `payload` as one framed message.
    fn send(&self, payload: &[u8]) -> Result<bool>;

    /// Block until a length prefix arrives and return it in host order.
    fn receive_length_prefix(&self) -> Result<Option<u32>>;

    /// Block until exactly `size` payload bytes arrive.
    fn receive(&self, size: usize) -> Result<Option<Vec<u8>>>;

    /// Non-blocking check for unread bytes.
    fn has_pending_data(&self) -> bool;

    /// Receive one complete message: prefix, then payload.
    ///
    /// A zero-length prefix yields an empty message.
    fn receive_message(&self) -> Result<Option<Vec<u8>>> {
        match self.receive_length_prefix()? {
            None => Ok(None),
            Some(0) => Ok(Some(Vec::new())),
            Some(size) => self.receive(size as usize),
        }
    }

    fn send_str(&self, text: &str) -> Result<bool> {
        self.send(text.as_bytes())
    }

    /// Receive one message and decode it as UTF-8, replacing invalid bytes.
    fn receive_string(&self) -> Result<Option<String>> {
        Ok(self
            .receive_message()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}
