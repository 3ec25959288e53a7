use std::io;
use std::sync::{PoisonError, RwLock};

use bytes::BytesMut;
use netbase_transport::{
    Endpoint, EndpointConfig, EventKind, NetAddress, Peek, Result, Socket, SocketKind,
    TransportError,
};
use tracing::{debug, info, warn};

use crate::codec::{decode_payload, decode_prefix, encode_payload, encode_prefix, FrameConfig, PREFIX_SIZE};
use crate::framing::Framing;

/// Framing over connectionless datagrams.
///
/// Every message travels as two datagrams: the 4-byte prefix, then the
/// payload. Loss or reordering between the two is not reconciled; a
/// datagram of the wrong size is reported as a receive error.
#[derive(Debug)]
pub struct DatagramTransport {
    endpoint: Endpoint,
    destination: RwLock<Option<NetAddress>>,
    config: FrameConfig,
}

impl DatagramTransport {
    /// Configure an idle datagram transport. No socket is opened.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Ok(Self::from_endpoint(Endpoint::configure(config)?))
    }

    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            destination: RwLock::new(None),
            config: FrameConfig::default(),
        }
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.config = config;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_running()
    }

    /// Open a datagram socket bound to the configured local address.
    ///
    /// Returns `Ok(false)` if already open.
    pub fn open(&self) -> Result<bool> {
        let started = self
            .endpoint
            .start_with(SocketKind::Datagram, |socket, address| {
                socket
                    .set_reuse_address()
                    .map_err(TransportError::SetOptions)?;
                socket.bind(address).map_err(|source| TransportError::Bind {
                    address: address.clone(),
                    source,
                })
            })?;
        if started {
            let bound = self.endpoint.bound_address();
            info!(address = %self.endpoint.address(), bound = ?bound, "datagram endpoint ready");
            self.endpoint
                .record(EventKind::EndpointReady, &self.endpoint.info())?;
        }
        Ok(started)
    }

    /// Close the socket. `Ok(false)` if already closed.
    pub fn close(&self) -> Result<bool> {
        let info = self.endpoint.info();
        let closed = self.endpoint.teardown()?;
        if closed {
            info!(address = %self.endpoint.address(), "datagram endpoint closed");
            self.endpoint.record(EventKind::EndpointClosed, &info)?;
        }
        Ok(closed)
    }

    /// Close, reapply `config`, and open again.
    pub fn reload(&mut self, config: EndpointConfig) -> Result<bool> {
        self.close()?;
        self.endpoint.reconfigure(config)?;
        self.open()
    }

    /// Direct subsequent transfers at `address:port`.
    ///
    /// The address is interpreted in the endpoint's mode; the port is ignored
    /// for unix domain endpoints.
    pub fn set_destination(&self, address: &str, port: u16) -> Result<()> {
        let resolved = NetAddress::resolve(address, port, self.endpoint.mode())?;
        debug!(destination = %resolved, "datagram destination set");
        *self
            .destination
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(resolved);
        Ok(())
    }

    pub fn clear_destination(&self) {
        *self
            .destination
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn destination(&self) -> Option<NetAddress> {
        self.destination
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receive one datagram that must be exactly `expected` bytes long.
    fn receive_exact(&self, expected: usize) -> Option<io::Result<(Vec<u8>, NetAddress)>> {
        self.endpoint.collect(|socket| {
            // One spare byte exposes oversized datagrams, which the kernel
            // would otherwise truncate silently.
            let mut buf = vec![0u8; expected + 1];
            let (n, source) = socket.recv_from(&mut buf)?;
            let source = source.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{n}-byte datagram without a source address"),
                )
            })?;
            if n != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected a {expected}-byte datagram from {source}, got {n} bytes"),
                ));
            }
            buf.truncate(expected);
            Ok((buf, source))
        })
    }
}

impl Framing for DatagramTransport {
    fn send(&self, payload: &[u8]) -> Result<bool> {
        if payload.is_empty() {
            return Ok(false);
        }
        let Some(destination) = self.destination() else {
            return Ok(false);
        };
        let endpoint = &self.endpoint;
        let fail = |e| endpoint.fail(TransportError::Transfer(e));

        self.config.check(payload.len()).map_err(fail)?;
        let prefix = encode_prefix(payload.len()).map_err(fail)?;
        let mut body = BytesMut::with_capacity(payload.len());
        encode_payload(payload, &mut body);

        let sent = endpoint.transmit(|socket| -> io::Result<()> {
            socket.send_to(&prefix, &destination)?;
            socket.send_to(&body, &destination)?;
            Ok(())
        });
        match sent {
            None => Ok(false),
            Some(Err(e)) => Err(fail(e)),
            Some(Ok(())) => {
                debug!(bytes = payload.len(), peer = %destination, "datagram transmitted");
                endpoint.record(
                    EventKind::DataTransmitted,
                    &format!("TX: {} | {}", payload.len(), destination.info(endpoint.raw_fd())),
                )?;
                Ok(true)
            }
        }
    }

    fn receive_length_prefix(&self) -> Result<Option<u32>> {
        if self.destination().is_none() {
            return Ok(None);
        }
        match self.receive_exact(PREFIX_SIZE) {
            None => Ok(None),
            Some(Err(_)) if self.endpoint.closed_locally() => Ok(None),
            Some(Err(e)) => Err(self.endpoint.fail(TransportError::Receive(e))),
            Some(Ok((bytes, _))) => {
                let mut prefix = [0u8; PREFIX_SIZE];
                prefix.copy_from_slice(&bytes);
                Ok(Some(decode_prefix(prefix)))
            }
        }
    }

    fn receive(&self, size: usize) -> Result<Option<Vec<u8>>> {
        let Some(destination) = self.destination() else {
            return Ok(None);
        };
        self.config
            .check(size)
            .map_err(|e| self.endpoint.fail(TransportError::Receive(e)))?;
        match self.receive_exact(size) {
            None => Ok(None),
            Some(Err(_)) if self.endpoint.closed_locally() => Ok(None),
            Some(Err(e)) => Err(self.endpoint.fail(TransportError::Receive(e))),
            Some(Ok((mut payload, source))) => {
                if source != destination {
                    warn!(%source, %destination, "datagram from unexpected source");
                }
                decode_payload(&mut payload);
                debug!(bytes = payload.len(), peer = %source, "datagram received");
                self.endpoint.record(
                    EventKind::DataReceived,
                    &format!("RX: {} | {}", payload.len(), source.info(self.endpoint.raw_fd())),
                )?;
                Ok(Some(payload))
            }
        }
    }

    fn has_pending_data(&self) -> bool {
        matches!(self.endpoint.with_socket(Socket::peek), Some(Peek::Pending))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use netbase_transport::{ErrorKind, EventLog, MemorySink, Mode};

    use super::*;

    fn bound() -> (DatagramTransport, u16) {
        let transport =
            DatagramTransport::new(EndpointConfig::new("127.0.0.1", 0, Mode::Remote)).unwrap();
        assert!(transport.open().unwrap());
        let port = transport.endpoint().bound_address().unwrap().port();
        (transport, port)
    }

    fn wait_for_data(transport: &DatagramTransport) {
        for _ in 0..200 {
            if transport.has_pending_data() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no datagram arrived");
    }

    #[test]
    fn no_destination_means_no_transfer() {
        let (a, _) = bound();
        assert!(a.destination().is_none());
        assert!(!a.send(b"ping").unwrap());
        assert!(a.receive_length_prefix().unwrap().is_none());
        assert!(a.receive(4).unwrap().is_none());
    }

    #[test]
    fn not_running_means_no_transfer() {
        let a = DatagramTransport::new(EndpointConfig::new("127.0.0.1", 0, Mode::Remote)).unwrap();
        a.set_destination("127.0.0.1", 9).unwrap();
        assert!(!a.send(b"ping").unwrap());
        assert!(a.receive_message().unwrap().is_none());
        assert!(!a.has_pending_data());
    }

    #[test]
    fn exchange_between_two_endpoints() {
        let (a, a_port) = bound();
        let (b, b_port) = bound();
        a.set_destination("127.0.0.1", b_port).unwrap();
        b.set_destination("127.0.0.1", a_port).unwrap();

        assert!(a.send(b"ping").unwrap());
        wait_for_data(&b);
        assert_eq!(b.receive_message().unwrap().unwrap(), b"ping");

        assert!(b.send_str("pong").unwrap());
        assert_eq!(a.receive_string().unwrap().unwrap(), "pong");
    }

    #[test]
    fn wrong_sized_datagram_is_receive_error() {
        let (a, a_port) = bound();
        let (b, b_port) = bound();
        a.set_destination("127.0.0.1", b_port).unwrap();
        b.set_destination("127.0.0.1", a_port).unwrap();

        // Payload-only datagram where a prefix is expected.
        let target = NetAddress::resolve("127.0.0.1", b_port, Mode::Remote).unwrap();
        a.endpoint()
            .with_socket(|s| s.send_to(b"hello", &target))
            .unwrap()
            .unwrap();

        let err = b.receive_length_prefix().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Receive);
        assert_eq!(b.endpoint().last_error(), ErrorKind::Receive);
    }

    #[test]
    fn clear_destination_stops_transfers() {
        let (a, _) = bound();
        a.set_destination("127.0.0.1", 9).unwrap();
        assert!(a.destination().is_some());
        a.clear_destination();
        assert!(!a.send(b"x").unwrap());
    }

    #[test]
    fn open_and_close_are_logged() {
        let sink = MemorySink::new();
        let endpoint = Endpoint::configure(EndpointConfig::new("127.0.0.1", 0, Mode::Remote))
            .unwrap()
            .with_event_log(EventLog::with_sink(Arc::new(sink.clone())));
        let transport = DatagramTransport::from_endpoint(endpoint);

        assert!(transport.open().unwrap());
        assert!(!transport.open().unwrap());
        assert!(transport.close().unwrap());
        assert!(!transport.close().unwrap());

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] Endpoint ready (IP address: 127.0.0.1   Port: 0   Socket: "));
        assert!(lines[1].contains("[INFO] Endpoint closed"));
    }

    #[test]
    fn close_wakes_blocked_receive_without_error() {
        let sink = MemorySink::new();
        let endpoint = Endpoint::configure(EndpointConfig::new("127.0.0.1", 0, Mode::Remote))
            .unwrap()
            .with_event_log(EventLog::with_sink(Arc::new(sink.clone())));
        let transport = Arc::new(DatagramTransport::from_endpoint(endpoint));
        transport.open().unwrap();
        transport.set_destination("127.0.0.1", 9).unwrap();

        let receiver = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.receive_length_prefix())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(transport.close().unwrap());

        assert!(receiver.join().unwrap().unwrap().is_none());
        assert_eq!(transport.endpoint().last_error(), ErrorKind::None);
        assert!(sink.lines().iter().all(|line| !line.contains("[ERROR]")));
    }

    #[test]
    fn unix_domain_exchange() {
        let dir = std::env::temp_dir().join(format!(
            "netbase-dgram-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path_a = dir.join("a.sock").to_string_lossy().into_owned();
        let path_b = dir.join("b.sock").to_string_lossy().into_owned();

        let a = DatagramTransport::new(EndpointConfig::new(path_a.clone(), 0, Mode::Local)).unwrap();
        let b = DatagramTransport::new(EndpointConfig::new(path_b.clone(), 0, Mode::Local)).unwrap();
        assert!(a.open().unwrap());
        assert!(b.open().unwrap());
        a.set_destination(&path_b, 0).unwrap();
        b.set_destination(&path_a, 0).unwrap();

        assert!(a.send_str("over a unix socket").unwrap());
        wait_for_data(&b);
        assert_eq!(
            b.receive_string().unwrap().as_deref(),
            Some("over a unix socket")
        );
        assert!(b.send(b"ack").unwrap());
        assert_eq!(a.receive_message().unwrap().unwrap(), b"ack");

        a.close().unwrap();
        b.close().unwrap();
        assert!(!std::path::Path::new(&path_a).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_destination_is_rejected() {
        let (a, _) = bound();
        let err = a.set_destination("not-an-ip", 1).unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
        assert!(a.destination().is_none());
    }
}
