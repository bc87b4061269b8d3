//! Outbound TCP transport, for tools that listen instead of connecting.

use std::{net::TcpStream, os::fd::OwnedFd};

use tracing::info;

use crate::TransportError;

/// Connects to `host:port`, resolving `host` if needed, and returns a non-blocking socket.
///
/// The connect itself blocks; it happens once at startup.
pub fn tcp(host: &str, port: u16) -> Result<OwnedFd, TransportError> {
    let addr = format!("{host}:{port}");

    let stream = TcpStream::connect((host, port))
        .map_err(|source| TransportError::Connect { addr: addr.clone(), source })?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;

    info!(%addr, "socket: connected");

    Ok(stream.into())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fd = tcp("127.0.0.1", port).unwrap();
        let (_peer, addr) = listener.accept().unwrap();

        let stream = TcpStream::from(fd);
        assert_eq!(stream.local_addr().unwrap(), addr);
    }

    #[test]
    fn refused_connection_is_reported() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        assert!(matches!(tcp("127.0.0.1", port), Err(TransportError::Connect { .. })));
    }
}
