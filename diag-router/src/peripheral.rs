use std::{
    fs::File,
    io::{self, Read},
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use diag_common::{Flow, FlowOptions, Queue, Reactor, WatchId};

use crate::Token;

/// The modem side of the router. The descriptor preserves message boundaries: every read
/// returns one message and every write sends one.
#[derive(Debug)]
pub(crate) struct Peripheral {
    file: File,
    pub(crate) queue: Queue,
    /// Counts the broadcast copies of peripheral output still queued at clients.
    pub(crate) flow: Flow,
    pub(crate) read_watch: Option<WatchId>,
    pub(crate) write_watch: Option<WatchId>,
}

impl Peripheral {
    pub(crate) fn new(fd: OwnedFd, flow: FlowOptions) -> Self {
        Self {
            file: fd.into(),
            queue: Queue::new(),
            flow: Flow::new(flow),
            read_watch: None,
            write_watch: None,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Queues a message towards the modem, attributed to `flow`.
    pub(crate) fn send(&mut self, reactor: &mut Reactor<Token>, msg: &[u8], flow: &Flow) {
        self.queue.push_with_flow(msg, flow);
        if let Some(id) = self.write_watch {
            reactor.resume(id);
        }
    }

    /// Reads one message into `scratch`.
    pub(crate) fn read(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(scratch) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        self.queue.write_messages(&mut self.file)
    }
}
