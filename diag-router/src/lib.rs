//! Routes diagnostic messages between connected tools and the modem.
//!
//! The [`Router`] owns every client, listener and the peripheral, and implements
//! [`diag_common::Handler`] so a [`diag_common::Reactor`] drives it:
//!
//! ```no_run
//! use diag_common::Reactor;
//! use diag_router::{Router, RouterOptions};
//! use diag_transport::Listener;
//!
//! let mut reactor = Reactor::new()?;
//! let mut router = Router::new(RouterOptions::default());
//! router.add_listener(&mut reactor, Listener::tcp4([127, 0, 0, 1].into(), 2500)?)?;
//! reactor.run(&mut router)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use diag_common::{constants::KiB, FlowOptions, ReactorError};
use diag_wire::hdlc::DEFAULT_MAX_FRAME_SIZE;
use thiserror::Error;

mod client;
pub use client::ClientId;

pub mod command;
pub use command::{command_key, CommandHandler, CommandRegistry, Reply};

mod peripheral;

mod router;
pub use router::{AllClients, BroadcastFilter, ListenerId, Router, Token};

/// Errors returned by [`Router`] operations.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("a peripheral is already attached")]
    PeripheralAttached,
}

/// Tunables of a [`Router`].
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// Water marks of every client flow and of the peripheral flow.
    pub flow: FlowOptions,
    /// Largest message accepted from or sent to a client.
    pub max_frame_size: usize,
    /// Bytes requested per read from a stream client.
    pub read_chunk: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self { flow: FlowOptions::default(), max_frame_size: DEFAULT_MAX_FRAME_SIZE, read_chunk: 4 * KiB }
    }
}

impl RouterOptions {
    /// Sets the water marks of every flow.
    pub fn flow(mut self, flow: FlowOptions) -> Self {
        self.flow = flow;
        self
    }

    /// Sets the largest accepted message.
    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Sets the number of bytes requested per stream read.
    pub fn read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk;
        self
    }
}
