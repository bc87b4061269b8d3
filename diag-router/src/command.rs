//! Local command handlers.
//!
//! A frame is looked up by a 32-bit key built from its first bytes: the command code in the
//! top byte and, for subsystem dispatch commands, the subsystem id and subsystem command code
//! below it. Handlers are registered for a single key or an inclusive key range; the first
//! registration matching a key wins.

use std::{fmt, ops::RangeInclusive};

use diag_common::Reactor;

use crate::{client::Client, ClientId, Token};

/// Subsystem dispatch command.
pub const DIAG_CMD_SUBSYS_DISPATCH: u8 = 0x4b;
/// Second generation subsystem dispatch command.
pub const DIAG_CMD_SUBSYS_DISPATCH_V2: u8 = 0x80;

/// Key of a plain command.
pub const fn key(cmd: u8) -> u32 {
    (cmd as u32) << 24
}

/// Key of a subsystem dispatch command.
pub const fn subsys_key(cmd: u8, subsys: u8, code: u16) -> u32 {
    key(cmd) | (subsys as u32) << 16 | code as u32
}

/// Computes the lookup key of a frame, or `None` for an empty frame.
pub fn command_key(frame: &[u8]) -> Option<u32> {
    match *frame {
        [] => None,
        [cmd @ (DIAG_CMD_SUBSYS_DISPATCH | DIAG_CMD_SUBSYS_DISPATCH_V2), subsys, lo, hi, ..] => {
            Some(subsys_key(cmd, subsys, u16::from_le_bytes([lo, hi])))
        }
        [cmd, ..] => Some(key(cmd)),
    }
}

/// Lets a handler answer the client that sent the frame.
pub struct Reply<'a> {
    pub(crate) client: &'a mut Client,
    pub(crate) reactor: &'a mut Reactor<Token>,
}

impl Reply<'_> {
    /// The client being answered.
    pub fn client(&self) -> ClientId {
        self.client.id
    }

    /// Queues `payload` for the requesting client. The reply counts against that client's
    /// own flow.
    pub fn send(&mut self, payload: &[u8]) {
        let flow = self.client.flow.clone();
        self.client.send(self.reactor, payload, Some(&flow));
    }
}

impl fmt::Debug for Reply<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").field("client", &self.client.id).finish()
    }
}

/// A command handler. Runs synchronously on the reactor thread and must not block.
pub type CommandHandler = Box<dyn FnMut(&mut Reply<'_>, &[u8])>;

struct Entry {
    keys: RangeInclusive<u32>,
    handler: CommandHandler,
}

/// Local handlers, looked up by command key.
#[derive(Default)]
pub struct CommandRegistry {
    entries: Vec<Entry>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for exactly `key`.
    pub fn register<F>(&mut self, key: u32, handler: F)
    where
        F: FnMut(&mut Reply<'_>, &[u8]) + 'static,
    {
        self.register_range(key, key, handler);
    }

    /// Registers `handler` for every key in `first..=last`.
    ///
    /// # Panics
    /// Panics if `first > last`.
    pub fn register_range<F>(&mut self, first: u32, last: u32, handler: F)
    where
        F: FnMut(&mut Reply<'_>, &[u8]) + 'static,
    {
        assert!(first <= last, "empty command range {first:#010x}..={last:#010x}");
        self.entries.push(Entry { keys: first..=last, handler: Box::new(handler) });
    }

    /// Returns the first handler registered for `key`.
    pub fn lookup(&mut self, key: u32) -> Option<&mut CommandHandler> {
        self.entries.iter_mut().find(|entry| entry.keys.contains(&key)).map(|entry| &mut entry.handler)
    }

    /// Returns the number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| format!("{:#010x}..={:#010x}", e.keys.start(), e.keys.end())))
            .finish()
    }
}
