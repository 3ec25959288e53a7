use std::sync::Arc;

use netbase_frame::{FrameConfig, Framing, StreamTransport};
use netbase_transport::{
    Endpoint, EndpointConfig, EventKind, NetAddress, Socket, SocketKind, TransportError,
};
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::error::{PeerError, Result};
use crate::pool::{ThreadPool, WorkerPool};
use crate::registry::{ClientHandle, ClientInfo, ClientRegistry};

/// Default bound on concurrently registered clients.
pub const DEFAULT_MAX_CONNECTIONS: u16 = 16;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Local address to listen on.
    pub endpoint: EndpointConfig,
    /// Maximum number of registered clients; also the listen backlog.
    pub max_connections: u16,
}

impl ServerConfig {
    pub fn new(endpoint: EndpointConfig, max_connections: u16) -> Self {
        Self {
            endpoint,
            max_connections,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(EndpointConfig::default(), DEFAULT_MAX_CONNECTIONS)
    }
}

/// Multi-client stream server.
///
/// Each call to [`accept_and_dispatch`](Self::accept_and_dispatch) accepts
/// one client, queues its [`ClientConnection`] and submits a task to the
/// worker pool. The task is expected to take a connection with
/// [`claim_next_handle`](Self::claim_next_handle); connections come out in
/// acceptance order.
///
/// ```text
/// Idle --start()--> Listening --stop()--> Idle
/// ```
#[derive(Debug)]
pub struct StreamServer<P: WorkerPool = ThreadPool> {
    config: ServerConfig,
    endpoint: Endpoint,
    frame_config: FrameConfig,
    registry: Arc<ClientRegistry>,
    pool: P,
}

impl StreamServer<ThreadPool> {
    /// Configure a server with one worker thread per allowed connection.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let pool = ThreadPool::new(usize::from(config.max_connections.max(1)));
        Self::with_pool(config, pool)
    }
}

impl<P: WorkerPool> StreamServer<P> {
    /// Configure a server dispatching to `pool`. Nothing is opened yet.
    pub fn with_pool(config: ServerConfig, pool: P) -> Result<Self> {
        let endpoint = Endpoint::configure(config.endpoint.clone())?;
        Ok(Self::from_parts(config, endpoint, pool))
    }

    /// Assemble a server from an already configured endpoint, e.g. one with
    /// a custom event log.
    pub fn from_parts(config: ServerConfig, endpoint: Endpoint, pool: P) -> Self {
        Self {
            config,
            endpoint,
            frame_config: FrameConfig::default(),
            registry: ClientRegistry::new(),
            pool,
        }
    }

    /// Frame limits applied to every accepted client.
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn max_connections(&self) -> u16 {
        self.config.max_connections
    }

    /// Address the listening socket is bound to, with the real port when
    /// port 0 was configured.
    pub fn bound_address(&self) -> Option<NetAddress> {
        self.endpoint.bound_address()
    }

    /// Listening socket open and worker pool running.
    pub fn is_running(&self) -> bool {
        self.endpoint.is_running() && self.pool.is_running()
    }

    /// Open, bind and listen, then start the worker pool.
    ///
    /// Returns `Ok(false)` if the server was already listening.
    pub fn start(&self) -> Result<bool> {
        let backlog = self.config.max_connections;
        let started = self
            .endpoint
            .start_with(SocketKind::Stream, |socket, address| {
                socket
                    .set_reuse_address()
                    .map_err(TransportError::SetOptions)?;
                socket.bind(address).map_err(|source| TransportError::Bind {
                    address: address.clone(),
                    source,
                })?;
                socket.listen(backlog).map_err(TransportError::Listen)
            })?;
        if !started {
            return Ok(false);
        }

        if let Err(err) = self.pool.start() {
            // Best effort; the pool failure is what the caller needs to see.
            let _ = self.endpoint.teardown();
            return Err(err);
        }

        let bound = self.bound_address();
        info!(
            address = %self.endpoint.address(),
            bound = ?bound,
            max_connections = backlog,
            "server started"
        );
        self.endpoint
            .record(EventKind::ServerStarted, &self.endpoint.info())?;
        Ok(true)
    }

    /// Close the listener and every client, wait for running tasks, stop
    /// the pool and forget all clients.
    ///
    /// Every step is attempted; the first failure is returned. Returns
    /// `Ok(false)` if the server was already stopped.
    pub fn stop(&self) -> Result<bool> {
        if !self.endpoint.is_running() && !self.pool.is_running() {
            return Ok(false);
        }
        let info = self.endpoint.info();
        let mut first_error: Option<PeerError> = None;

        if let Err(err) = self.endpoint.teardown() {
            first_error.get_or_insert(err.into());
        }
        for client in self.registry.snapshot() {
            if let Err(err) = self.close_client(client.handle) {
                first_error.get_or_insert(err);
            }
        }

        self.pool.wait_for_idle();
        self.pool.stop();
        drop(self.registry.clear());

        info!(address = %self.endpoint.address(), "server stopped");
        if let Err(err) = self.endpoint.record(EventKind::ServerStopped, &info) {
            first_error.get_or_insert(err.into());
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Accept one client and dispatch `task` to the worker pool.
    ///
    /// Blocks in accept. Returns `Ok(None)` without blocking when the server
    /// is not running or already holds `max_connections` clients.
    pub fn accept_and_dispatch<F>(&self, task: F) -> Result<Option<ClientHandle>>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            return Ok(None);
        }
        if self.registry.len() >= usize::from(self.config.max_connections) {
            debug!(max = self.config.max_connections, "client registry full");
            return Ok(None);
        }

        let (socket, peer) = match self.endpoint.with_socket(Socket::accept) {
            None => return Ok(None),
            Some(Err(err)) if self.endpoint.closed_locally() => {
                debug!(error = %err, "accept woken by server stop");
                return Ok(None);
            }
            Some(Err(err)) => {
                return Err(self.endpoint.fail(TransportError::Accept(err)).into());
            }
            Some(Ok(accepted)) => accepted,
        };

        let log = self.endpoint.event_log().clone();
        let transport = StreamTransport::from_socket(socket, peer.clone(), log)
            .with_frame_config(self.frame_config.clone());
        let fd = transport.endpoint().raw_fd();
        let handle = self.registry.admit(peer.clone(), transport);

        if let Err(err) = self.pool.submit(Box::new(task)) {
            warn!(client = %handle, error = %err, "failed to dispatch client task");
            self.discard(handle);
            return Err(err);
        }

        info!(client = %handle, peer = %peer, "client connected");
        self.endpoint
            .record(EventKind::ClientConnected, &peer.info(fd))?;
        Ok(Some(handle))
    }

    /// Take the oldest accepted connection no worker has claimed yet.
    pub fn claim_next_handle(&self) -> Option<ClientConnection> {
        self.registry.claim_next()
    }

    /// Close one client and drop it from the registry.
    ///
    /// The entry is removed even if closing the socket fails. Returns
    /// `Ok(false)` for an unknown handle.
    pub fn close_client(&self, handle: ClientHandle) -> Result<bool> {
        let Some((peer, transport, unclaimed)) = self.registry.remove(handle) else {
            return Ok(false);
        };
        let fd = transport.as_ref().and_then(|t| t.endpoint().raw_fd());
        let closed = match &transport {
            Some(transport) => transport.close(),
            None => Ok(false),
        };
        drop(unclaimed);

        if let Err(err) = closed {
            return Err(self.endpoint.fail(err).into());
        }

        info!(client = %handle, peer = %peer, "client disconnected");
        self.endpoint
            .record(EventKind::ClientDisconnected, &peer.info(fd))?;
        Ok(true)
    }

    /// Liveness of one client; false for unknown or closed handles.
    pub fn is_connected(&self, handle: ClientHandle) -> bool {
        self.registry
            .lookup(handle)
            .is_some_and(|(_, transport)| transport.is_alive())
    }

    /// Send one framed message to a registered client.
    ///
    /// `Ok(false)` for unknown handles, like any transport that is not in a
    /// state to send.
    pub fn send_to(&self, handle: ClientHandle, payload: &[u8]) -> Result<bool> {
        match self.registry.lookup(handle) {
            Some((_, transport)) => Ok(transport.send(payload)?),
            None => Ok(false),
        }
    }

    /// Receive one framed message from a registered client.
    pub fn receive_from(&self, handle: ClientHandle) -> Result<Option<Vec<u8>>> {
        match self.registry.lookup(handle) {
            Some((_, transport)) => Ok(transport.receive_message()?),
            None => Ok(None),
        }
    }

    /// Read the 4-byte length prefix of the next message from a client.
    pub fn receive_length_prefix_from(&self, handle: ClientHandle) -> Result<Option<u32>> {
        match self.registry.lookup(handle) {
            Some((_, transport)) => Ok(transport.receive_length_prefix()?),
            None => Ok(None),
        }
    }

    /// Read exactly `size` payload bytes from a client, normally the size
    /// returned by [`receive_length_prefix_from`](Self::receive_length_prefix_from).
    pub fn receive_payload_from(
        &self,
        handle: ClientHandle,
        size: usize,
    ) -> Result<Option<Vec<u8>>> {
        match self.registry.lookup(handle) {
            Some((_, transport)) => Ok(transport.receive(size)?),
            None => Ok(None),
        }
    }

    /// Non-blocking check for unread bytes from a client.
    pub fn has_pending_data(&self, handle: ClientHandle) -> bool {
        self.registry
            .lookup(handle)
            .is_some_and(|(_, transport)| transport.has_pending_data())
    }

    /// Registered clients in acceptance order.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.registry.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop, apply `config`, and start again.
    pub fn reload(&mut self, config: ServerConfig) -> Result<bool> {
        self.stop()?;
        self.endpoint.reconfigure(config.endpoint.clone())?;
        self.pool.configure(usize::from(config.max_connections.max(1)))?;
        self.config = config;
        self.start()
    }

    fn discard(&self, handle: ClientHandle) {
        if let Some((_, transport, unclaimed)) = self.registry.remove(handle) {
            if let Some(transport) = transport {
                let _ = transport.close();
            }
            drop(unclaimed);
        }
    }
}

impl<P: WorkerPool> Drop for StreamServer<P> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "server stop on drop failed");
        }
    }
}
