//! USB FunctionFS transport.
//!
//! The gadget itself is set up elsewhere; this only opens the bulk endpoints of an instance
//! whose descriptors have already been written to `ep0`.
//!
//! FunctionFS endpoint files do not support `poll`, so epoll refuses to register them
//! (`EPERM`). [`bridge`] relays them through a stream socket pair on two blocking threads and
//! hands the router a descriptor it can watch like any other byte-stream client.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    net::Shutdown,
    os::{fd::OwnedFd, unix::net::UnixStream},
    path::Path,
    thread,
};

use tracing::{debug, info, warn};

use crate::TransportError;

/// The two bulk endpoints of a FunctionFS instance.
#[derive(Debug)]
pub struct Endpoints {
    /// `ep2`, host to device. Read by the router.
    pub rx: OwnedFd,
    /// `ep1`, device to host. Written by the router.
    pub tx: OwnedFd,
}

fn open_endpoint(path: &Path, write: bool) -> Result<OwnedFd, TransportError> {
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .open(path)
        .map_err(|source| TransportError::Open { path: path.display().to_string(), source })?;

    Ok(file.into())
}

/// Opens the endpoints below the FunctionFS mount point `dir`. The descriptors are blocking.
pub fn open(dir: impl AsRef<Path>) -> Result<Endpoints, TransportError> {
    let dir = dir.as_ref();

    // Without ep0 there is no configured function to talk to.
    let ep0 = dir.join("ep0");
    if !ep0.exists() {
        return Err(TransportError::Open {
            path: ep0.display().to_string(),
            source: io::ErrorKind::NotFound.into(),
        });
    }

    let tx = open_endpoint(&dir.join("ep1"), true)?;
    let rx = open_endpoint(&dir.join("ep2"), false)?;

    info!(dir = %dir.display(), "usb: opened endpoints");

    Ok(Endpoints { rx, tx })
}

/// Relays `endpoints` through a socket pair and returns the non-blocking end for the router.
///
/// When the host side stops (`ep2` reaches end of file or fails) the socket is shut down, so
/// the router sees end of stream and tears the client down. When the router closes its end,
/// the relay towards `ep1` stops.
pub fn bridge(endpoints: Endpoints) -> Result<OwnedFd, TransportError> {
    let (ours, theirs) = UnixStream::pair()?;
    ours.set_nonblocking(true)?;

    let Endpoints { rx, tx } = endpoints;
    let mut to_router = theirs.try_clone()?;
    let mut from_router = theirs;

    thread::Builder::new().name("usb-rx".into()).spawn(move || {
        relay("rx", &mut File::from(rx), &mut to_router);
        let _ = to_router.shutdown(Shutdown::Both);
    })?;

    thread::Builder::new().name("usb-tx".into()).spawn(move || {
        relay("tx", &mut from_router, &mut File::from(tx));
    })?;

    Ok(ours.into())
}

fn relay(direction: &'static str, src: &mut impl Read, dst: &mut impl Write) {
    match io::copy(src, dst) {
        Ok(bytes) => debug!(direction, bytes, "usb: relay finished"),
        Err(e) => warn!(direction, err = ?e, "usb: relay failed"),
    }
}
