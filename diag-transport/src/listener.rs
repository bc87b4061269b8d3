use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info};

use crate::{Connection, TransportError};

/// Pending connections allowed on a listening socket.
pub const DEFAULT_BACKLOG: i32 = 2;

/// The kinds of listening socket the router accepts clients on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// TCP over IPv4.
    Tcp4,
    /// TCP over IPv6 only.
    Tcp6,
    /// The local control socket. Its clients exchange bare messages, one per packet.
    Control,
}

impl ListenerKind {
    /// Short name used in client labels and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Control => "control",
        }
    }

    /// Whether connections accepted on this kind of listener carry HDLC frames.
    pub fn framing(&self) -> bool {
        !matches!(self, Self::Control)
    }
}

/// A non-blocking listening socket.
pub struct Listener {
    kind: ListenerKind,
    socket: Socket,
    /// The bound address, for logging.
    addr: String,
    /// Socket file to unlink on drop.
    path: Option<PathBuf>,
}

impl Listener {
    /// Binds a TCP listener on an IPv4 address.
    pub fn tcp4(addr: Ipv4Addr, port: u16) -> Result<Self, TransportError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(addr, port));
        info!("tcp4: binding to {addr}");

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        Self::listen(ListenerKind::Tcp4, socket, &addr.into(), addr.to_string(), None)
    }

    /// Binds a TCP listener on an IPv6 address. The socket does not accept IPv4-mapped
    /// connections, so a `tcp4` listener on the same port can coexist.
    pub fn tcp6(addr: Ipv6Addr, port: u16) -> Result<Self, TransportError> {
        let addr = SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0));
        info!("tcp6: binding to {addr}");

        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_only_v6(true)?;
        socket.set_reuse_address(true)?;

        Self::listen(ListenerKind::Tcp6, socket, &addr.into(), addr.to_string(), None)
    }

    /// Binds the local control socket at `path`, replacing a stale socket file.
    pub fn control(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        info!("control: binding to {}", path.display());

        if path.exists() {
            debug!("Socket file already exists. Attempting to remove.");
            std::fs::remove_file(path).map_err(|source| TransportError::Bind {
                addr: path.display().to_string(),
                source,
            })?;
        }

        let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
        let addr = SockAddr::unix(path)?;

        Self::listen(
            ListenerKind::Control,
            socket,
            &addr,
            path.display().to_string(),
            Some(path.to_path_buf()),
        )
    }

    fn listen(
        kind: ListenerKind,
        socket: Socket,
        addr: &SockAddr,
        display: String,
        path: Option<PathBuf>,
    ) -> Result<Self, TransportError> {
        socket
            .bind(addr)
            .map_err(|source| TransportError::Bind { addr: display.clone(), source })?;
        socket
            .listen(DEFAULT_BACKLOG)
            .map_err(|source| TransportError::Listen { addr: display.clone(), source })?;
        socket.set_nonblocking(true)?;

        Ok(Self { kind, socket, addr: display, path })
    }

    /// Returns what kind of listener this is.
    #[inline]
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Short name of the listener kind.
    #[inline]
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    /// Returns the bound IP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok().and_then(|addr| addr.as_socket())
    }

    /// Accepts exactly one pending connection and puts it into non-blocking mode.
    pub fn accept(&self) -> io::Result<Connection> {
        let (socket, peer) = self.socket.accept()?;
        socket.set_nonblocking(true)?;

        let peer = match peer.as_socket() {
            Some(addr) => addr.to_string(),
            None => self.addr.clone(),
        };

        debug!(kind = self.label(), fd = socket.as_raw_fd(), %peer, "accepted connection");

        Ok(Connection {
            label: self.label(),
            fd: socket.into(),
            framing: self.kind.framing(),
            peer,
        })
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(ref path) = self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}
