use netbase_frame::{FrameConfig, Framing, StreamTransport};
use netbase_transport::{
    Endpoint, EndpointConfig, EventKind, NetAddress, Result, SocketKind, TransportError,
};
use tracing::info;

/// Single-peer stream client.
///
/// The configured address is the remote end to connect to.
#[derive(Debug)]
pub struct StreamClient {
    transport: StreamTransport,
}

impl StreamClient {
    /// Configure an idle client for `config`. Nothing is connected yet.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Ok(Self {
            transport: StreamTransport::new(config)?,
        })
    }

    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            transport: StreamTransport::from_endpoint(endpoint),
        }
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.transport = self.transport.with_frame_config(config);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }

    /// Remote address this client connects to.
    pub fn peer(&self) -> &NetAddress {
        self.endpoint().address()
    }

    /// Open a stream socket and connect it to the configured peer.
    ///
    /// Returns `Ok(false)` if already connected. On failure the socket is
    /// closed before the error is returned.
    pub fn connect(&self) -> Result<bool> {
        let connected = self
            .endpoint()
            .start_with(SocketKind::Stream, |socket, address| {
                socket
                    .connect(address)
                    .map_err(|source| TransportError::Connect {
                        address: address.clone(),
                        source,
                    })
            })?;
        if connected {
            info!(peer = %self.peer(), "connected");
            self.endpoint()
                .record(EventKind::ClientConnected, &self.endpoint().info())?;
        }
        Ok(connected)
    }

    /// Close the connection. `Ok(false)` if it was not open.
    pub fn disconnect(&self) -> Result<bool> {
        let info = self.endpoint().info();
        let closed = self.transport.close()?;
        if closed {
            info!(peer = %self.peer(), "disconnected");
            self.endpoint()
                .record(EventKind::ClientDisconnected, &info)?;
        }
        Ok(closed)
    }

    /// Liveness poll: false when not connected, when the peer has closed,
    /// or when the socket reports an error.
    pub fn is_running(&self) -> bool {
        self.transport.is_alive()
    }

    /// Disconnect, apply `config`, and connect again.
    pub fn reload(&mut self, config: EndpointConfig) -> Result<bool> {
        self.disconnect()?;
        self.transport.endpoint_mut().reconfigure(config)?;
        self.connect()
    }

    /// Disconnect and forget the configuration.
    pub fn reset(&mut self) -> Result<()> {
        self.disconnect()?;
        self.transport.endpoint_mut().reset()
    }
}

impl Framing for StreamClient {
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

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;

    use netbase_transport::{ErrorKind, EventLog, MemorySink, Mode};

    use super::*;

    #[test]
    fn connect_refused_is_connect_error() {
        // Grab a free port, then release it so nothing listens there.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = StreamClient::new(EndpointConfig::new("127.0.0.1", port, Mode::Remote)).unwrap();

        let err = client.connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert!(!client.endpoint().is_running());
        assert!(!client.is_running());
        assert_eq!(client.endpoint().last_error(), ErrorKind::Connect);
    }

    #[test]
    fn connect_and_disconnect_are_logged() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let sink = MemorySink::new();
        let endpoint = Endpoint::configure(EndpointConfig::new("127.0.0.1", port, Mode::Remote))
            .unwrap()
            .with_event_log(EventLog::with_sink(Arc::new(sink.clone())));
        let client = StreamClient::from_endpoint(endpoint);

        assert!(client.connect().unwrap());
        assert!(!client.connect().unwrap());
        let (_server_side, _) = listener.accept().unwrap();
        assert!(client.is_running());

        assert!(client.disconnect().unwrap());
        assert!(!client.disconnect().unwrap());
        assert!(!client.is_running());

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(&format!(
            "[INFO] Client connected to the server (IP address: 127.0.0.1   Port: {port}   Socket: "
        )));
        assert!(lines[1].contains("[INFO] Client disconnected from the server"));
    }

    #[test]
    fn peer_close_ends_liveness() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = StreamClient::new(EndpointConfig::new("127.0.0.1", port, Mode::Remote)).unwrap();
        client.connect().unwrap();

        let (server_side, _) = listener.accept().unwrap();
        assert!(client.is_running());
        drop(server_side);

        let mut alive = true;
        for _ in 0..100 {
            alive = client.is_running();
            if !alive {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(!alive);
    }

    #[test]
    fn reload_reconnects_elsewhere() {
        let first = TcpListener::bind("127.0.0.1:0").unwrap();
        let second = TcpListener::bind("127.0.0.1:0").unwrap();
        let second_port = second.local_addr().unwrap().port();

        let mut client = StreamClient::new(EndpointConfig::new(
            "127.0.0.1",
            first.local_addr().unwrap().port(),
            Mode::Remote,
        ))
        .unwrap();
        client.connect().unwrap();

        assert!(client
            .reload(EndpointConfig::new("127.0.0.1", second_port, Mode::Remote))
            .unwrap());
        assert_eq!(client.peer().port(), second_port);
        let _accepted = second.accept().unwrap();

        client.reset().unwrap();
        assert!(!client.endpoint().is_running());
    }
}
