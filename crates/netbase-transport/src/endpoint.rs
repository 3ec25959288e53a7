use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{error, warn};

use crate::address::{EndpointConfig, Mode, NetAddress};
use crate::error::{ErrorKind, Result, TransportError};
use crate::event::{EventKind, EventLog};
use crate::socket::{Socket, SocketKind};

/// A process-local endpoint owning at most one socket.
///
/// The socket slot is empty iff the endpoint is not running. Readers of the
/// slot (transfers, liveness polls) share the lock; opening and closing take
/// it exclusively. Two extra mutexes serialize whole framed messages per
/// direction, so a blocked receive never holds up a sender.
#[derive(Debug)]
pub struct Endpoint {
    config: EndpointConfig,
    address: NetAddress,
    log: EventLog,
    socket: RwLock<Option<Socket>>,
    closed_locally: AtomicBool,
    last_error: Mutex<ErrorKind>,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl Endpoint {
    /// Resolve `config` into an idle endpoint. No socket is opened.
    pub fn configure(config: EndpointConfig) -> Result<Self> {
        let address = config.resolve()?;
        let log = event_log_for(&config);
        Ok(Self {
            config,
            address,
            log,
            socket: RwLock::new(None),
            closed_locally: AtomicBool::new(false),
            last_error: Mutex::new(ErrorKind::None),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        })
    }

    /// Wrap an already connected socket, e.g. one returned by accept.
    ///
    /// `address` is the peer the socket talks to; the endpoint starts out
    /// running and reports events to `log`.
    pub fn from_socket(socket: Socket, address: NetAddress, log: EventLog) -> Self {
        let config = EndpointConfig::new(address.host(), address.port(), address.mode());
        Self {
            config,
            address,
            log,
            socket: RwLock::new(Some(socket)),
            closed_locally: AtomicBool::new(false),
            last_error: Mutex::new(ErrorKind::None),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    /// Replace the event log target, e.g. with an in-memory sink.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Configured local address.
    pub fn address(&self) -> &NetAddress {
        &self.address
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.config.log_file.as_deref()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn last_error(&self) -> ErrorKind {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff a socket is open.
    pub fn is_running(&self) -> bool {
        self.read_slot().is_some()
    }

    /// True once [`teardown`](Self::teardown) has begun shutting the socket
    /// down, until the next successful start.
    ///
    /// Threads woken from a blocking call use this to tell their own
    /// endpoint's shutdown apart from a failure.
    pub fn closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::Acquire)
    }

    /// Descriptor of the open socket, for diagnostics.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.read_slot().as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Address the open socket is actually bound to (resolves port 0).
    pub fn bound_address(&self) -> Option<NetAddress> {
        self.read_slot()
            .as_ref()
            .and_then(|socket| socket.local_address().ok())
    }

    /// Audit line for the local side of this endpoint.
    pub fn info(&self) -> String {
        self.address.info(self.raw_fd())
    }

    /// Open a socket of `kind`, run `prepare` on it, then publish it.
    ///
    /// Returns `Ok(false)` if the endpoint is already running. When `prepare`
    /// fails the socket is closed and the slot stays empty.
    pub fn start_with<F>(&self, kind: SocketKind, prepare: F) -> Result<bool>
    where
        F: FnOnce(&mut Socket, &NetAddress) -> Result<()>,
    {
        let mut slot = self.write_slot();
        if slot.is_some() {
            return Ok(false);
        }

        let mut socket =
            Socket::open(self.address.mode(), kind).map_err(|e| self.fail(TransportError::Open(e)))?;
        if let Err(err) = prepare(&mut socket, &self.address) {
            drop(socket);
            return Err(self.fail(err));
        }

        *slot = Some(socket);
        self.closed_locally.store(false, Ordering::Release);
        Ok(true)
    }

    /// Close the socket if one is open.
    ///
    /// Threads blocked on the socket are woken by a shutdown before the
    /// descriptor is closed. Returns `Ok(false)` when already stopped.
    pub fn teardown(&self) -> Result<bool> {
        if let Some(socket) = self.read_slot().as_ref() {
            self.closed_locally.store(true, Ordering::Release);
            let _ = socket.shutdown();
        }

        let Some(socket) = self.write_slot().take() else {
            return Ok(false);
        };
        socket
            .close()
            .map_err(|e| self.fail(TransportError::Close(e)))?;
        Ok(true)
    }

    /// Tear down and reapply `config`, clearing the last error.
    pub fn reconfigure(&mut self, config: EndpointConfig) -> Result<()> {
        self.teardown()?;
        let address = config.resolve()?;
        self.log = event_log_for(&config);
        self.address = address;
        self.config = config;
        self.set_last_error(ErrorKind::None);
        Ok(())
    }

    /// Tear down and return to the default, unconfigured state.
    pub fn reset(&mut self) -> Result<()> {
        self.reconfigure(EndpointConfig::default())
    }

    /// Run `f` against the open socket under the shared lock.
    pub fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> R) -> Option<R> {
        self.read_slot().as_ref().map(f)
    }

    /// Like [`with_socket`](Self::with_socket), holding the send lock so a
    /// multi-part message is not interleaved with another sender's.
    pub fn transmit<R>(&self, f: impl FnOnce(&Socket) -> R) -> Option<R> {
        let _send = lock(&self.send_lock);
        self.with_socket(f)
    }

    /// Like [`with_socket`](Self::with_socket), holding the receive lock.
    pub fn collect<R>(&self, f: impl FnOnce(&Socket) -> R) -> Option<R> {
        let _recv = lock(&self.recv_lock);
        self.with_socket(f)
    }

    /// Append a lifecycle event to the event log.
    pub fn record(&self, event: EventKind, detail: &str) -> Result<()> {
        self.log.event(event, detail).map_err(|e| {
            self.set_last_error(ErrorKind::Log);
            error!(error = %e, ?event, "failed to write event log");
            TransportError::Log(e)
        })
    }

    /// Record `err` as the last error, log it, and hand it back.
    ///
    /// A failure to write the log is recorded as [`ErrorKind::Log`] but does
    /// not replace `err`.
    pub fn fail(&self, err: TransportError) -> TransportError {
        let kind = err.kind();
        self.set_last_error(kind);
        warn!(address = %self.address, error = %err, "endpoint operation failed");

        let detail = err
            .io_error()
            .map(ToString::to_string)
            .unwrap_or_else(|| err.to_string());
        if let Err(log_err) = self.log.error(kind, &detail) {
            self.set_last_error(ErrorKind::Log);
            error!(error = %log_err, "failed to write event log");
        }
        err
    }

    fn set_last_error(&self, kind: ErrorKind) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = kind;
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Option<Socket>> {
        self.socket.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<Socket>> {
        self.socket.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn event_log_for(config: &EndpointConfig) -> EventLog {
    match &config.log_file {
        Some(path) => EventLog::to_file(path),
        None => EventLog::disabled(),
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
