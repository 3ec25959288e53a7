use std::ffi::OsString;
use std::io::{self, ErrorKind};
use std::mem::{self, offset_of, size_of};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::address::{Mode, NetAddress};

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SEND_FLAGS: libc::c_int = 0;

/// Socket semantics requested at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Outcome of a non-blocking peek.
#[derive(Debug)]
pub enum Peek {
    /// At least one byte is waiting.
    Pending,
    /// Nothing to read yet; the peer is still there.
    Idle,
    /// Orderly shutdown by the peer.
    Closed,
    /// Any other socket failure.
    Failed(io::Error),
}

impl Peek {
    /// Liveness: an idle or readable socket counts as connected.
    pub fn is_alive(&self) -> bool {
        matches!(self, Peek::Pending | Peek::Idle)
    }
}

/// An owned OS socket.
///
/// The descriptor is closed exactly once: either through [`Socket::close`],
/// which reports the OS result, or on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
    kind: SocketKind,
    bound_path: Option<BoundPath>,
}

impl Socket {
    /// Allocate a socket of the family selected by `mode`.
    pub fn open(mode: Mode, kind: SocketKind) -> io::Result<Self> {
        let domain = match mode {
            Mode::Local => libc::AF_UNIX,
            Mode::Remote => libc::AF_INET,
        };
        let ty = match kind {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::Datagram => libc::SOCK_DGRAM,
        };

        // SAFETY: plain syscall with constant arguments.
        let raw = cvt(unsafe { libc::socket(domain, ty, 0) })?;
        // SAFETY: `raw` was just returned by socket(2) and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        // SAFETY: `fd` is an open descriptor.
        cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;

        let socket = Self {
            fd,
            kind,
            bound_path: None,
        };
        #[cfg(target_vendor = "apple")]
        socket.set_flag(libc::SO_NOSIGPIPE)?;
        Ok(socket)
    }

    /// Create a connected pair of unix domain sockets.
    pub fn pair(kind: SocketKind) -> io::Result<(Self, Self)> {
        let ty = match kind {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::Datagram => libc::SOCK_DGRAM,
        };
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is a valid two-element buffer.
        cvt(unsafe { libc::socketpair(libc::AF_UNIX, ty, 0, fds.as_mut_ptr()) })?;
        // SAFETY: both descriptors were just returned by socketpair(2).
        let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((Self::from_owned(a, kind), Self::from_owned(b, kind)))
    }

    fn from_owned(fd: OwnedFd, kind: SocketKind) -> Self {
        Self {
            fd,
            kind,
            bound_path: None,
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Allow rebinding a recently used local address.
    pub fn set_reuse_address(&self) -> io::Result<()> {
        self.set_flag(libc::SO_REUSEADDR)
    }

    fn set_flag(&self, option: libc::c_int) -> io::Result<()> {
        let value: libc::c_int = 1;
        // SAFETY: `value` outlives the call and the length matches its type.
        cvt(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                option,
                (&value as *const libc::c_int).cast::<libc::c_void>(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    /// Bind to `address`.
    ///
    /// For unix domain addresses a stale socket file is removed first, but
    /// never a non-socket file. The created path is removed again when the
    /// socket is closed, unless it was replaced in the meantime.
    pub fn bind(&mut self, address: &NetAddress) -> io::Result<()> {
        if let NetAddress::Unix(path) = address {
            remove_stale_socket(path)?;
        }

        let (storage, len) = encode_address(address)?;
        // SAFETY: `storage` holds a valid address of length `len`.
        cvt(unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
                len,
            )
        })?;

        if let NetAddress::Unix(path) = address {
            let metadata = std::fs::symlink_metadata(path)?;
            self.bound_path = Some(BoundPath {
                path: path.clone(),
                dev: metadata.dev(),
                ino: metadata.ino(),
            });
        }
        Ok(())
    }

    /// Mark the socket as passive with the given backlog.
    pub fn listen(&self, backlog: u16) -> io::Result<()> {
        // SAFETY: plain syscall on an owned descriptor.
        cvt(unsafe { libc::listen(self.fd.as_raw_fd(), libc::c_int::from(backlog)) })?;
        Ok(())
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> io::Result<(Socket, NetAddress)> {
        loop {
            // SAFETY: all-zero bytes are a valid `sockaddr_storage`.
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: `storage` and `len` are valid writable pointers for their sizes.
            let rc = unsafe {
                libc::accept(
                    self.fd.as_raw_fd(),
                    (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
                    &mut len,
                )
            };
            match cvt(rc) {
                Ok(raw) => {
                    // SAFETY: `raw` was just returned by accept(2).
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    // SAFETY: `fd` is an open descriptor.
                    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
                    let socket = Self::from_owned(fd, SocketKind::Stream);
                    #[cfg(target_vendor = "apple")]
                    socket.set_flag(libc::SO_NOSIGPIPE)?;
                    let peer = decode_address(&storage, len).ok_or_else(unsupported_family)?;
                    return Ok((socket, peer));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Connect to `address` (blocking).
    pub fn connect(&self, address: &NetAddress) -> io::Result<()> {
        let (storage, len) = encode_address(address)?;
        // SAFETY: `storage` holds a valid address of length `len`.
        cvt(unsafe {
            libc::connect(
                self.fd.as_raw_fd(),
                (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
                len,
            )
        })?;
        Ok(())
    }

    /// Write the whole buffer to a connected socket.
    pub fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // SAFETY: `buf` is a valid readable region of `buf.len()` bytes.
            let rc = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            match cvt_size(rc) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Fill `buf` completely from a connected socket.
    ///
    /// Returns `UnexpectedEof` when the peer closes first.
    pub fn recv_exact(&self, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // SAFETY: `buf` is a valid writable region of `buf.len()` bytes.
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    libc::MSG_WAITALL,
                )
            };
            match cvt_size(rc) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                Ok(n) => buf = &mut mem::take(&mut buf)[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Send one datagram to `address`.
    pub fn send_to(&self, buf: &[u8], address: &NetAddress) -> io::Result<usize> {
        let (storage, len) = encode_address(address)?;
        loop {
            // SAFETY: `buf` and `storage` are valid for the lengths passed.
            let rc = unsafe {
                libc::sendto(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    SEND_FLAGS,
                    (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
                    len,
                )
            };
            match cvt_size(rc) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Receive one datagram into `buf`; excess bytes are discarded.
    ///
    /// The source is `None` when the kernel reports no address, as happens
    /// when a shutdown wakes the call.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<NetAddress>)> {
        loop {
            // SAFETY: all-zero bytes are a valid `sockaddr_storage`.
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: `buf`, `storage` and `len` are valid writable regions.
            let rc = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    0,
                    (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
                    &mut len,
                )
            };
            match cvt_size(rc) {
                Ok(n) => return Ok((n, decode_address(&storage, len))),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Look at the receive queue without consuming or blocking.
    pub fn peek(&self) -> Peek {
        let mut byte = [0u8; 1];
        // SAFETY: `byte` is a valid one-byte writable buffer.
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                byte.as_mut_ptr().cast::<libc::c_void>(),
                byte.len(),
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        match cvt_size(rc) {
            Ok(0) => Peek::Closed,
            Ok(_) => Peek::Pending,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Peek::Idle
            }
            Err(err) => Peek::Failed(err),
        }
    }

    /// Shut down both directions, waking any thread blocked on this socket.
    ///
    /// The descriptor stays open.
    pub fn shutdown(&self) -> io::Result<()> {
        // SAFETY: plain syscall on an owned descriptor.
        cvt(unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) })?;
        Ok(())
    }

    /// Address the socket is bound to.
    pub fn local_address(&self) -> io::Result<NetAddress> {
        // SAFETY: all-zero bytes are a valid `sockaddr_storage`.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: `storage` and `len` are valid writable pointers for their sizes.
        cvt(unsafe {
            libc::getsockname(
                self.fd.as_raw_fd(),
                (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
                &mut len,
            )
        })?;
        decode_address(&storage, len).ok_or_else(unsupported_family)
    }

    /// Close the descriptor and report the OS result.
    pub fn close(self) -> io::Result<()> {
        let Socket { fd, bound_path, .. } = self;
        drop(bound_path);
        let raw = fd.into_raw_fd();
        // SAFETY: ownership of `raw` was released by `into_raw_fd`; it is closed once here.
        cvt(unsafe { libc::close(raw) })?;
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Filesystem path created by binding a unix domain socket.
#[derive(Debug)]
struct BoundPath {
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl Drop for BoundPath {
    fn drop(&mut self) {
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == self.dev
                && metadata.ino() == self.ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            ErrorKind::AlreadyExists,
            "existing path is not a unix socket",
        ));
    }
    debug!(?path, "removing stale socket");
    std::fs::remove_file(path)
}

fn encode_address(address: &NetAddress) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
    // SAFETY: all-zero bytes are a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match address {
        NetAddress::Inet(addr) => {
            // SAFETY: `sockaddr_storage` is large and aligned enough for `sockaddr_in`.
            let sin = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>()
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            size_of::<libc::sockaddr_in>()
        }
        NetAddress::Unix(path) => {
            // SAFETY: `sockaddr_storage` is large and aligned enough for `sockaddr_un`.
            let sun = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_un>()
            };
            let bytes = path.as_os_str().as_bytes();
            if bytes.len() >= sun.sun_path.len() {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "unix socket path too long",
                ));
            }
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1
        }
    };
    Ok((storage, len as libc::socklen_t))
}

fn decode_address(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<NetAddress> {
    if (len as usize) < size_of::<libc::sa_family_t>() {
        return None;
    }
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // SAFETY: the family tag says the storage holds a `sockaddr_in`.
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
            };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(NetAddress::Inet(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_UNIX => {
            // SAFETY: the family tag says the storage holds a `sockaddr_un`.
            let sun = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_un>()
            };
            let path_len = (len as usize)
                .saturating_sub(offset_of!(libc::sockaddr_un, sun_path))
                .min(sun.sun_path.len());
            let bytes: Vec<u8> = sun.sun_path[..path_len]
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as u8)
                .collect();
            Some(NetAddress::Unix(PathBuf::from(OsString::from_vec(bytes))))
        }
        _ => None,
    }
}

fn unsupported_family() -> io::Error {
    io::Error::new(ErrorKind::InvalidData, "unsupported socket address family")
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn cvt_size(rc: libc::ssize_t) -> io::Result<usize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_sock_path(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "netbase-sock-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("test.sock")
    }

    #[test]
    fn pair_send_and_recv_exact() {
        let (a, b) = Socket::pair(SocketKind::Stream).unwrap();
        a.send_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        b.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn recv_exact_reports_eof() {
        let (a, b) = Socket::pair(SocketKind::Stream).unwrap();
        a.send_all(b"ab").unwrap();
        drop(a);

        let mut buf = [0u8; 4];
        let err = b.recv_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn peek_states() {
        let (a, b) = Socket::pair(SocketKind::Stream).unwrap();
        assert!(matches!(b.peek(), Peek::Idle));

        a.send_all(b"x").unwrap();
        assert!(matches!(b.peek(), Peek::Pending));
        // Peeking does not consume.
        assert!(matches!(b.peek(), Peek::Pending));

        let mut buf = [0u8; 1];
        b.recv_exact(&mut buf).unwrap();
        drop(a);
        assert!(matches!(b.peek(), Peek::Closed));
        assert!(!b.peek().is_alive());
    }

    #[test]
    fn shutdown_wakes_blocked_receiver() {
        let (a, b) = Socket::pair(SocketKind::Stream).unwrap();
        let b = std::sync::Arc::new(b);
        let reader = std::sync::Arc::clone(&b);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.recv_exact(&mut buf)
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        b.shutdown().unwrap();
        let result = handle.join().unwrap();
        assert!(result.is_err());
        drop(a);
    }

    #[test]
    fn tcp_loopback_accept_connect() {
        let mut listener = Socket::open(Mode::Remote, SocketKind::Stream).unwrap();
        listener.set_reuse_address().unwrap();
        listener
            .bind(&NetAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .unwrap();
        listener.listen(4).unwrap();
        let address = listener.local_address().unwrap();
        assert_ne!(address.port(), 0);

        let client = Socket::open(Mode::Remote, SocketKind::Stream).unwrap();
        client.connect(&address).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        assert_eq!(peer.host(), "127.0.0.1");

        client.send_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        accepted.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        accepted.close().unwrap();
    }

    #[test]
    fn udp_send_to_recv_from() {
        let any = NetAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let mut a = Socket::open(Mode::Remote, SocketKind::Datagram).unwrap();
        a.bind(&any).unwrap();
        let mut b = Socket::open(Mode::Remote, SocketKind::Datagram).unwrap();
        b.bind(&any).unwrap();

        let b_addr = b.local_address().unwrap();
        a.send_to(b"dgram", &b_addr).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"dgram");
        assert_eq!(from, Some(a.local_address().unwrap()));
    }

    #[test]
    fn shutdown_wakes_recv_from_without_source() {
        let any = NetAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let mut socket = Socket::open(Mode::Remote, SocketKind::Datagram).unwrap();
        socket.bind(&any).unwrap();
        let socket = std::sync::Arc::new(socket);

        let receiver = {
            let socket = std::sync::Arc::clone(&socket);
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                socket.recv_from(&mut buf)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        // Unconnected datagram sockets report ENOTCONN but still wake readers.
        let _ = socket.shutdown();

        let (n, source) = receiver.join().unwrap().unwrap();
        assert_eq!(n, 0);
        assert_eq!(source, None);
    }

    #[test]
    fn unix_bind_cleans_up_path() {
        let path = temp_sock_path("cleanup");
        let mut listener = Socket::open(Mode::Local, SocketKind::Stream).unwrap();
        listener.bind(&NetAddress::Unix(path.clone())).unwrap();
        listener.listen(1).unwrap();
        assert!(path.exists());
        assert_eq!(
            listener.local_address().unwrap(),
            NetAddress::Unix(path.clone())
        );

        listener.close().unwrap();
        assert!(!path.exists(), "socket file should be cleaned up on close");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn unix_bind_rejects_existing_non_socket_file() {
        let path = temp_sock_path("regular");
        std::fs::write(&path, b"regular-file").unwrap();

        let mut socket = Socket::open(Mode::Local, SocketKind::Stream).unwrap();
        let err = socket.bind(&NetAddress::Unix(path.clone())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
