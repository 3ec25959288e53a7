use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use netbase_frame::StreamTransport;
use netbase_transport::NetAddress;

use crate::connection::ClientConnection;

/// Identifies one accepted client for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(u64);

impl ClientHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Snapshot of one registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub handle: ClientHandle,
    pub peer: NetAddress,
}

#[derive(Debug)]
struct ClientEntry {
    handle: ClientHandle,
    peer: NetAddress,
    transport: Weak<StreamTransport>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_handle: u64,
    entries: Vec<ClientEntry>,
    handoff: VecDeque<ClientConnection>,
}

/// Live clients in acceptance order, plus the queue of unclaimed ones.
///
/// Entries do not own their connection: each one holds a weak reference to
/// the transport owned by its [`ClientConnection`], and the connection
/// removes its entry when dropped. Connections leaving the handoff queue are
/// always dropped after the lock is released.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    state: Mutex<RegistryState>,
}

impl ClientRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a freshly accepted client and queue it for a worker.
    pub(crate) fn admit(self: &Arc<Self>, peer: NetAddress, transport: StreamTransport) -> ClientHandle {
        let transport = Arc::new(transport);
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = ClientHandle(state.next_handle);
        state.entries.push(ClientEntry {
            handle,
            peer: peer.clone(),
            transport: Arc::downgrade(&transport),
        });
        state.handoff.push_back(ClientConnection::new(
            handle,
            peer,
            transport,
            Arc::downgrade(self),
        ));
        handle
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<ClientInfo> {
        self.lock()
            .entries
            .iter()
            .map(|entry| ClientInfo {
                handle: entry.handle,
                peer: entry.peer.clone(),
            })
            .collect()
    }

    pub(crate) fn claim_next(&self) -> Option<ClientConnection> {
        self.lock().handoff.pop_front()
    }

    pub(crate) fn lookup(&self, handle: ClientHandle) -> Option<(NetAddress, Arc<StreamTransport>)> {
        let state = self.lock();
        let entry = state.entries.iter().find(|entry| entry.handle == handle)?;
        let transport = entry.transport.upgrade()?;
        Some((entry.peer.clone(), transport))
    }

    /// Remove `handle` and hand back its transport so the caller can close
    /// it. An unclaimed connection is taken out of the handoff queue too.
    pub(crate) fn remove(
        &self,
        handle: ClientHandle,
    ) -> Option<(NetAddress, Option<Arc<StreamTransport>>, Option<ClientConnection>)> {
        let mut state = self.lock();
        let index = state.entries.iter().position(|entry| entry.handle == handle)?;
        let entry = state.entries.remove(index);
        let unclaimed = state
            .handoff
            .iter()
            .position(|connection| connection.handle() == handle)
            .and_then(|index| state.handoff.remove(index));
        Some((entry.peer, entry.transport.upgrade(), unclaimed))
    }

    /// Forget every entry; unclaimed connections are returned for dropping.
    pub(crate) fn clear(&self) -> Vec<ClientConnection> {
        let mut state = self.lock();
        state.entries.clear();
        state.handoff.drain(..).collect()
    }

    /// Called by a dropping connection.
    pub(crate) fn deregister(&self, handle: ClientHandle) {
        self.lock().entries.retain(|entry| entry.handle != handle);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
