//! The modem's diag channel.

use std::{
    fs::OpenOptions,
    os::{
        fd::OwnedFd,
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::Path,
};

use nix::libc;
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::info;

use crate::TransportError;

/// Opens the modem channel at `path`: a Unix seqpacket socket is connected to, anything else
/// (normally a character device) is opened for reading and writing. Either way the descriptor
/// is non-blocking and preserves message boundaries.
pub fn open(path: impl AsRef<Path>) -> Result<OwnedFd, TransportError> {
    let path = path.as_ref();
    let open_err = |source: std::io::Error| TransportError::Open { path: path.display().to_string(), source };

    let meta = std::fs::metadata(path).map_err(open_err)?;

    let fd: OwnedFd = if meta.file_type().is_socket() {
        let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
        socket
            .connect(&SockAddr::unix(path)?)
            .map_err(|source| TransportError::Connect { addr: path.display().to_string(), source })?;
        socket.set_nonblocking(true)?;
        socket.into()
    } else {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(open_err)?
            .into()
    };

    info!(path = %path.display(), "peripheral: opened");

    Ok(fd)
}
