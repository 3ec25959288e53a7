use std::sync::{Arc, Weak};

use netbase_frame::{Framing, StreamTransport};
use netbase_transport::{NetAddress, Result};

use crate::registry::{ClientHandle, ClientRegistry};

/// One accepted client, owned by whichever worker claimed it.
///
/// Dropping the connection removes it from the server's registry and then
/// closes the socket.
#[derive(Debug)]
pub struct ClientConnection {
    handle: ClientHandle,
    peer: NetAddress,
    transport: Arc<StreamTransport>,
    registry: Weak<ClientRegistry>,
}

impl ClientConnection {
    pub(crate) fn new(
        handle: ClientHandle,
        peer: NetAddress,
        transport: Arc<StreamTransport>,
        registry: Weak<ClientRegistry>,
    ) -> Self {
        Self {
            handle,
            peer,
            transport,
            registry,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    /// Address of the remote end.
    pub fn peer(&self) -> &NetAddress {
        &self.peer
    }

    /// Audit line for this connection.
    pub fn info(&self) -> String {
        self.peer.info(self.transport.endpoint().raw_fd())
    }

    /// Liveness poll. False once the peer has closed or the server closed
    /// this client.
    pub fn is_connected(&self) -> bool {
        self.transport.is_alive()
    }

    /// Close the socket now. The registry entry goes away on drop.
    pub fn close(&self) -> Result<bool> {
        self.transport.close()
    }
}

impl Framing for ClientConnection {
    fn send(&self, payload: &[u8]) -> Result<bool> {
        self.transport.send(payload)
    }

    fn receive_length_prefix(&self) -> Result<Option<u32>> {
        self.transport.receive_length_prefix()
    }

    fn receive(&self, size: usize) -> Result<Option<Vec<u8>>> {
        self.transport.receive(size)
    }

    fn has_pending_data(&self) -> bool {
        self.transport.has_pending_data()
    }

    fn receive_message(&self) -> Result<Option<Vec<u8>>> {
        self.transport.receive_message()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.handle);
        }
    }
}
