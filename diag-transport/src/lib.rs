//! Transports connecting diagnostic tools to the router.
//!
//! Everything here hands out plain non-blocking descriptors; registering them with the reactor
//! and speaking the wire format is the router's job.

use std::{io, os::fd::OwnedFd};

use thiserror::Error;

pub mod connect;
pub mod peripheral;
pub mod serial;
pub mod usb;

mod listener;
pub use listener::{Listener, ListenerKind, DEFAULT_BACKLOG};

/// Default TCP port for listeners and outbound connections.
pub const DEFAULT_SOCKET_PORT: u16 = 2500;

/// Default serial line speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Errors opening or accepting a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to listen on {addr}: {source}")]
    Listen { addr: String, source: io::Error },
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("terminal configuration failed: {0}")]
    Termios(#[from] nix::Error),
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),
}

/// A connection handed to the router.
#[derive(Debug)]
pub struct Connection {
    /// Short name of the transport, used in logs.
    pub label: &'static str,
    /// Non-blocking descriptor used in both directions.
    pub fd: OwnedFd,
    /// Whether the byte stream carries HDLC frames.
    pub framing: bool,
    /// Human readable peer address.
    pub peer: String,
}
