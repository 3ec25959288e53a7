use std::io;

use bytes::BytesMut;
use netbase_transport::{
    Endpoint, EndpointConfig, EventKind, EventLog, NetAddress, Peek, Result, Socket, SocketKind,
    TransportError,
};
use tracing::debug;

use crate::codec::{decode_payload, decode_prefix, encode_message, FrameConfig, PREFIX_SIZE};
use crate::framing::Framing;

/// Framing over a reliable, ordered byte stream.
///
/// One message is written with a single send of prefix and payload while
/// the endpoint's send lock is held, so concurrent senders never interleave.
#[derive(Debug)]
pub struct StreamTransport {
    endpoint: Endpoint,
    config: FrameConfig,
}

impl StreamTransport {
    /// Configure an idle stream transport.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Ok(Self::from_endpoint(Endpoint::configure(config)?))
    }

    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            config: FrameConfig::default(),
        }
    }

    /// Wrap a connected socket whose peer is `peer`.
    pub fn from_socket(socket: Socket, peer: NetAddress, log: EventLog) -> Self {
        Self::from_endpoint(Endpoint::from_socket(socket, peer, log))
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.config = config;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    pub fn frame_config(&self) -> &FrameConfig {
        &self.config
    }

    /// Allocate the stream socket. `Ok(false)` if already open.
    pub fn open(&self) -> Result<bool> {
        self.endpoint.start_with(SocketKind::Stream, |_, _| Ok(()))
    }

    /// Close the socket. `Ok(false)` if already closed.
    pub fn close(&self) -> Result<bool> {
        self.endpoint.teardown()
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_running()
    }

    /// Non-blocking peek; `None` when not running.
    pub fn peek(&self) -> Option<Peek> {
        self.endpoint.with_socket(Socket::peek)
    }

    /// Liveness poll: readable or idle counts as connected.
    pub fn is_alive(&self) -> bool {
        self.peek().is_some_and(|peek| peek.is_alive())
    }

    fn received(&self, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        debug!(bytes = payload.len(), peer = %self.endpoint.address(), "data received");
        self.endpoint
            .record(EventKind::DataReceived, &format!("RX: {}", payload.len()))?;
        Ok(Some(payload))
    }
}

impl Framing for StreamTransport {
    fn send(&self, payload: &[u8]) -> Result<bool> {
        if payload.is_empty() {
            return Ok(false);
        }
        let endpoint = &self.endpoint;
        let fail = |e| endpoint.fail(TransportError::Transfer(e));

        self.config.check(payload.len()).map_err(fail)?;
        let mut wire = BytesMut::with_capacity(PREFIX_SIZE + payload.len());
        encode_message(payload, &mut wire).map_err(fail)?;

        match endpoint.transmit(|socket| socket.send_all(&wire)) {
            None => Ok(false),
            Some(Err(e)) => Err(fail(e)),
            Some(Ok(())) => {
                debug!(bytes = payload.len(), peer = %endpoint.address(), "data transmitted");
                endpoint.record(EventKind::DataTransmitted, &format!("TX: {}", payload.len()))?;
                Ok(true)
            }
        }
    }

    fn receive_length_prefix(&self) -> Result<Option<u32>> {
        match self.endpoint.collect(read_prefix) {
            None => Ok(None),
            Some(Err(_)) if self.endpoint.closed_locally() => Ok(None),
            Some(Err(e)) => Err(self.endpoint.fail(TransportError::Receive(e))),
            Some(Ok(size)) => Ok(Some(size)),
        }
    }

    fn receive(&self, size: usize) -> Result<Option<Vec<u8>>> {
        self.config
            .check(size)
            .map_err(|e| self.endpoint.fail(TransportError::Receive(e)))?;
        match self.endpoint.collect(|socket| read_payload(socket, size)) {
            None => Ok(None),
            Some(Err(_)) if self.endpoint.closed_locally() => Ok(None),
            Some(Err(e)) => Err(self.endpoint.fail(TransportError::Receive(e))),
            Some(Ok(payload)) => self.received(payload),
        }
    }

    fn has_pending_data(&self) -> bool {
        matches!(self.peek(), Some(Peek::Pending))
    }

    /// Prefix and payload are read under one hold of the receive lock.
    fn receive_message(&self) -> Result<Option<Vec<u8>>> {
        let config = &self.config;
        let read = self.endpoint.collect(|socket| {
            let size = read_prefix(socket)? as usize;
            config.check(size)?;
            read_payload(socket, size)
        });
        match read {
            None => Ok(None),
            Some(Err(_)) if self.endpoint.closed_locally() => Ok(None),
            Some(Err(e)) => Err(self.endpoint.fail(TransportError::Receive(e))),
            Some(Ok(payload)) => self.received(payload),
        }
    }
}

fn read_prefix(socket: &Socket) -> io::Result<u32> {
    let mut prefix = [0u8; PREFIX_SIZE];
    socket.recv_exact(&mut prefix)?;
    Ok(decode_prefix(prefix))
}

fn read_payload(socket: &Socket, size: usize) -> io::Result<Vec<u8>> {
    let mut payload = vec![0u8; size];
    socket.recv_exact(&mut payload)?;
    decode_payload(&mut payload);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use netbase_transport::{bitorder, ErrorKind, MemorySink};

    use super::*;

    fn pair() -> (StreamTransport, StreamTransport) {
        let (a, b) = Socket::pair(SocketKind::Stream).expect("socketpair should succeed");
        let peer = NetAddress::Unix(Default::default());
        (
            StreamTransport::from_socket(a, peer.clone(), EventLog::disabled()),
            StreamTransport::from_socket(b, peer, EventLog::disabled()),
        )
    }

    fn raw_pair() -> (StreamTransport, Socket) {
        let (a, b) = Socket::pair(SocketKind::Stream).expect("socketpair should succeed");
        (
            StreamTransport::from_socket(a, NetAddress::Unix(Default::default()), EventLog::disabled()),
            b,
        )
    }

    #[test]
    fn round_trip_various_sizes() {
        let (tx, rx) = pair();
        let rx = thread::spawn(move || {
            let mut got = Vec::new();
            for _ in 0..5 {
                got.push(rx.receive_message().unwrap().unwrap());
            }
            got
        });

        let sizes = [1usize, 2, 255, 4096, 65535];
        let payloads: Vec<Vec<u8>> = sizes
            .iter()
            .map(|&n| (0..n).map(|i| (i % 251) as u8).collect())
            .collect();
        for payload in &payloads {
            assert!(tx.send(payload).unwrap());
        }

        assert_eq!(rx.join().unwrap(), payloads);
    }

    #[test]
    fn split_prefix_and_payload_receive() {
        let (tx, rx) = pair();
        tx.send(b"hello").unwrap();

        let size = rx.receive_length_prefix().unwrap().unwrap();
        assert_eq!(size, 5);
        let payload = rx.receive(size as usize).unwrap().unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn wire_bytes_are_prefixed_and_normalized() {
        let (tx, raw) = raw_pair();
        let original = b"ping".to_vec();
        let buffer = original.clone();
        tx.send(&buffer).unwrap();
        assert_eq!(buffer, original, "caller buffer must not change");

        let mut wire = [0u8; 8];
        raw.recv_exact(&mut wire).unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 4]);
        let mut payload = wire[4..].to_vec();
        if bitorder::transforms_payload() {
            assert_ne!(payload, original);
        }
        bitorder::normalize(&mut payload);
        assert_eq!(payload, original);
    }

    #[test]
    fn empty_payload_is_not_sent() {
        let (tx, rx) = pair();
        assert!(!tx.send(b"").unwrap());
        assert!(!rx.has_pending_data());
    }

    #[test]
    fn not_running_is_noop() {
        let transport =
            StreamTransport::new(EndpointConfig::new("127.0.0.1", 0, Default::default())).unwrap();
        assert!(!transport.send(b"x").unwrap());
        assert!(transport.receive_length_prefix().unwrap().is_none());
        assert!(transport.receive_message().unwrap().is_none());
        assert!(!transport.has_pending_data());
        assert!(!transport.is_alive());
    }

    #[test]
    fn open_and_close_are_idempotent() {
        let transport =
            StreamTransport::new(EndpointConfig::new("127.0.0.1", 0, Default::default())).unwrap();
        assert!(transport.open().unwrap());
        assert!(!transport.open().unwrap());
        assert!(transport.close().unwrap());
        assert!(!transport.close().unwrap());
    }

    #[test]
    fn pending_data_peek_does_not_consume() {
        let (tx, rx) = pair();
        assert!(!rx.has_pending_data());
        tx.send(b"abc").unwrap();

        assert!(rx.has_pending_data());
        assert!(rx.has_pending_data());
        assert_eq!(rx.receive_message().unwrap().unwrap(), b"abc");
        assert!(!rx.has_pending_data());
    }

    #[test]
    fn peer_close_is_receive_error() {
        let (tx, rx) = pair();
        drop(tx);
        let err = rx.receive_message().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Receive);
        assert!(err.is_disconnect());
        assert_eq!(rx.endpoint().last_error(), ErrorKind::Receive);
    }

    #[test]
    fn local_close_ends_blocked_receive_quietly() {
        let (_tx, rx) = pair();
        let rx = Arc::new(rx);
        let reader = {
            let rx = Arc::clone(&rx);
            thread::spawn(move || rx.receive_message())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(rx.close().unwrap());

        assert!(reader.join().unwrap().unwrap().is_none());
        assert_eq!(rx.endpoint().last_error(), ErrorKind::None);
    }

    #[test]
    fn oversized_payload_rejected() {
        let (tx, _rx) = pair();
        let tx = tx.with_frame_config(FrameConfig {
            max_payload_size: 4,
        });
        let err = tx.send(b"oversized").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
    }

    #[test]
    fn oversized_prefix_rejected_on_receive() {
        let (rx, raw) = raw_pair();
        let rx = rx.with_frame_config(FrameConfig {
            max_payload_size: 8,
        });
        raw.send_all(&1024u32.to_be_bytes()).unwrap();
        let err = rx.receive_message().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Receive);
    }

    #[test]
    fn concurrent_senders_do_not_interleave() {
        let (tx, rx) = pair();
        let tx = Arc::new(tx);
        let payload_len = 32 * 1024;

        let senders: Vec<_> = (0..4u8)
            .map(|id| {
                let tx = Arc::clone(&tx);
                thread::spawn(move || {
                    let payload = vec![id; payload_len];
                    for _ in 0..8 {
                        tx.send(&payload).unwrap();
                    }
                })
            })
            .collect();

        let receiver = thread::spawn(move || {
            for _ in 0..32 {
                let message = rx.receive_message().unwrap().unwrap();
                assert_eq!(message.len(), payload_len);
                assert!(message.iter().all(|b| *b == message[0]));
            }
        });

        for sender in senders {
            sender.join().unwrap();
        }
        receiver.join().unwrap();
    }

    #[test]
    fn data_events_are_logged() {
        let (a, b) = Socket::pair(SocketKind::Stream).unwrap();
        let sink = MemorySink::new();
        let log = EventLog::with_sink(Arc::new(sink.clone()));
        let peer = NetAddress::Unix(Default::default());
        let tx = StreamTransport::from_socket(a, peer.clone(), log.clone());
        let rx = StreamTransport::from_socket(b, peer, log);

        tx.send(b"four").unwrap();
        rx.receive_message().unwrap();

        let lines = sink.lines();
        assert!(lines[0].contains("Data have been transmitted (TX: 4)"));
        assert!(lines[1].contains("Data have been received (RX: 4)"));
    }
}
