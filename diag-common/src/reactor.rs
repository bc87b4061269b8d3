//! Single-threaded readiness reactor.
//!
//! The reactor owns a current-thread tokio runtime and registers every watched descriptor with
//! its I/O driver through [`AsyncFd`]. A [`Reactor::turn`] waits until at least one armed watch
//! is ready, snapshots the ready set, and then dispatches each entry to the [`Handler`]. Before
//! every dispatch the watch is looked up again by its generation-checked [`WatchId`], so a
//! callback may remove, pause or throttle any other watch (or tear down the object behind it)
//! and the rest of the tick will skip it.
//!
//! Readiness is edge-based underneath. A callback reports [`Next::Wait`] once it observed
//! [`std::io::ErrorKind::WouldBlock`], which clears the cached readiness; any other outcome
//! keeps it so the watch is dispatched again on the next turn.

use std::{
    fmt,
    future::Future,
    io,
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
    task::{ready, Context, Poll},
    time::Duration,
};

use futures::future::poll_fn;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{
    io::{unix::AsyncFd, Interest},
    runtime::Runtime,
};
use tracing::trace;

use crate::Flow;

/// Errors returned by the [`Reactor`].
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("fd {fd} already has a {direction:?} watch")]
    AlreadyWatched { fd: RawFd, direction: Direction },
}

/// The readiness a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The descriptor has data to read, or reached end of stream.
    Read,
    /// The descriptor accepts more data.
    Write,
}

/// Handle to a watch registration. Handles of removed watches never match a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId {
    index: u32,
    generation: u32,
}

/// What the reactor should do with a watch after its callback returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// The callback hit would-block; wait for the next readiness event.
    Wait,
    /// The descriptor may still be ready; dispatch again on the next turn.
    Again,
    /// Remove this watch before the next dispatch.
    Remove,
}

/// Receives the readiness events of a [`Reactor`].
pub trait Handler {
    /// Identifies what a watch belongs to.
    type Token: Copy + fmt::Debug;

    fn on_ready(&mut self, reactor: &mut Reactor<Self::Token>, token: Self::Token) -> Next;
}

struct Watch<T> {
    fd: RawFd,
    direction: Direction,
    token: T,
    flow: Option<Flow>,
    paused: bool,
}

impl<T> Watch<T> {
    fn is_armed(&self) -> bool {
        !self.paused && !self.flow.as_ref().is_some_and(Flow::is_throttled)
    }
}

struct Slot<T> {
    generation: u32,
    watch: Option<Watch<T>>,
}

/// A descriptor registered with the I/O driver, shared by its read and write watches.
struct Source {
    io: AsyncFd<RawFd>,
    watches: usize,
}

/// Dispatches descriptor readiness to a [`Handler`], tagging each watch with a token of type `T`.
pub struct Reactor<T> {
    runtime: Rc<Runtime>,
    sources: FxHashMap<RawFd, Source>,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    by_fd: FxHashMap<(RawFd, Direction), WatchId>,
    stopped: bool,
}

impl<T: Copy + fmt::Debug> Reactor<T> {
    /// Builds the runtime driving readiness. No descriptor is watched yet.
    pub fn new() -> Result<Self, ReactorError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_io().enable_time().build()?;

        Ok(Self {
            runtime: Rc::new(runtime),
            sources: FxHashMap::default(),
            slots: Vec::new(),
            free: Vec::new(),
            by_fd: FxHashMap::default(),
            stopped: false,
        })
    }

    /// Registers interest in `fd` becoming readable.
    pub fn add_read_watch(&mut self, fd: &impl AsRawFd, token: T) -> Result<WatchId, ReactorError> {
        self.add_watch(fd.as_raw_fd(), Direction::Read, token, None)
    }

    /// Registers interest in `fd` becoming readable. The watch is not dispatched while `flow`
    /// is throttled.
    pub fn add_read_watch_with_flow(
        &mut self,
        fd: &impl AsRawFd,
        token: T,
        flow: Flow,
    ) -> Result<WatchId, ReactorError> {
        self.add_watch(fd.as_raw_fd(), Direction::Read, token, Some(flow))
    }

    /// Registers interest in `fd` becoming writable.
    pub fn add_write_watch(&mut self, fd: &impl AsRawFd, token: T) -> Result<WatchId, ReactorError> {
        self.add_watch(fd.as_raw_fd(), Direction::Write, token, None)
    }

    fn add_watch(
        &mut self,
        fd: RawFd,
        direction: Direction,
        token: T,
        flow: Option<Flow>,
    ) -> Result<WatchId, ReactorError> {
        if self.by_fd.contains_key(&(fd, direction)) {
            return Err(ReactorError::AlreadyWatched { fd, direction });
        }

        if !self.sources.contains_key(&fd) {
            let _guard = self.runtime.enter();
            let io = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?;
            self.sources.insert(fd, Source { io, watches: 0 });
        }

        if let Some(source) = self.sources.get_mut(&fd) {
            source.watches += 1;
        }

        let watch = Watch { fd, direction, token, flow, paused: false };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].watch = Some(watch);
                index
            }
            None => {
                self.slots.push(Slot { generation: 0, watch: Some(watch) });
                (self.slots.len() - 1) as u32
            }
        };

        let id = WatchId { index, generation: self.slots[index as usize].generation };
        self.by_fd.insert((fd, direction), id);
        trace!(fd, ?direction, ?token, "watch added");

        Ok(id)
    }

    fn watch(&self, id: WatchId) -> Option<&Watch<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.watch.as_ref())
    }

    fn watch_mut(&mut self, id: WatchId) -> Option<&mut Watch<T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.watch.as_mut())
    }

    /// Removes a watch. Returns `false` if the handle is stale.
    ///
    /// When the last watch of a descriptor goes away, the descriptor is deregistered from the
    /// driver. Callers must remove their watches before closing the descriptor.
    pub fn remove(&mut self, id: WatchId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation {
            return false;
        }
        let Some(watch) = slot.watch.take() else {
            return false;
        };

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.by_fd.remove(&(watch.fd, watch.direction));

        if let Some(source) = self.sources.get_mut(&watch.fd) {
            source.watches -= 1;
            if source.watches == 0 {
                self.sources.remove(&watch.fd);
            }
        }

        trace!(fd = watch.fd, direction = ?watch.direction, token = ?watch.token, "watch removed");
        true
    }

    /// Stops dispatching a watch without removing its registration.
    pub fn pause(&mut self, id: WatchId) {
        if let Some(watch) = self.watch_mut(id) {
            watch.paused = true;
        }
    }

    /// Undoes [`Reactor::pause`].
    pub fn resume(&mut self, id: WatchId) {
        if let Some(watch) = self.watch_mut(id) {
            watch.paused = false;
        }
    }

    /// Returns `true` if `id` refers to a watch that has not been removed.
    #[inline]
    pub fn is_live(&self, id: WatchId) -> bool {
        self.watch(id).is_some()
    }

    /// Returns `true` if the watch is live and paused.
    #[inline]
    pub fn is_paused(&self, id: WatchId) -> bool {
        self.watch(id).is_some_and(|watch| watch.paused)
    }

    /// Returns the number of live watches.
    pub fn len(&self) -> usize {
        self.by_fd.len()
    }

    /// Returns `true` if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.by_fd.is_empty()
    }

    /// Makes [`Reactor::run`] return after the current turn.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Dispatches readiness events until [`Reactor::stop`] is called.
    pub fn run<H: Handler<Token = T>>(&mut self, handler: &mut H) -> Result<(), ReactorError> {
        self.stopped = false;
        while !self.stopped {
            self.turn(handler)?;
        }

        Ok(())
    }

    /// Waits until at least one armed watch is ready and dispatches every ready watch once.
    /// Returns the number of callbacks invoked.
    pub fn turn<H: Handler<Token = T>>(&mut self, handler: &mut H) -> Result<usize, ReactorError> {
        let runtime = Rc::clone(&self.runtime);
        let dispatched = runtime.block_on(poll_fn(|cx| self.poll_turn(handler, cx)))?;
        Ok(dispatched)
    }

    /// Like [`Reactor::turn`], but gives up after `timeout` and returns 0.
    pub fn turn_timeout<H: Handler<Token = T>>(
        &mut self,
        handler: &mut H,
        timeout: Duration,
    ) -> Result<usize, ReactorError> {
        let runtime = Rc::clone(&self.runtime);
        let turn = poll_fn(|cx| self.poll_turn(handler, cx));

        match runtime.block_on(with_timeout(timeout, turn)) {
            Some(result) => Ok(result?),
            None => Ok(0),
        }
    }

    fn poll_turn<H: Handler<Token = T>>(
        &mut self,
        handler: &mut H,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<usize>> {
        let ready = ready!(self.poll_ready(cx))?;
        let mut dispatched = 0;

        for (id, token) in ready {
            // An earlier callback of this turn may have removed, paused or throttled the watch.
            if !self.watch(id).is_some_and(Watch::is_armed) {
                continue;
            }

            dispatched += 1;
            match handler.on_ready(self, token) {
                Next::Again => {}
                Next::Wait => self.clear_readiness(id, cx),
                Next::Remove => {
                    self.remove(id);
                }
            }
        }

        Poll::Ready(Ok(dispatched))
    }

    /// Collects the armed watches whose descriptor is ready.
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<Vec<(WatchId, T)>>> {
        let mut ready = Vec::new();

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(ref watch) = slot.watch else { continue };
            if !watch.is_armed() {
                continue;
            }
            let Some(source) = self.sources.get(&watch.fd) else { continue };

            let polled = match watch.direction {
                Direction::Read => source.io.poll_read_ready(cx).map_ok(drop),
                Direction::Write => source.io.poll_write_ready(cx).map_ok(drop),
            };

            match polled {
                Poll::Ready(Ok(())) => {
                    let id = WatchId { index: index as u32, generation: slot.generation };
                    ready.push((id, watch.token));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    }

    fn clear_readiness(&self, id: WatchId, cx: &mut Context<'_>) {
        let Some(watch) = self.watch(id) else { return };
        let Some(source) = self.sources.get(&watch.fd) else { return };

        match watch.direction {
            Direction::Read => {
                if let Poll::Ready(Ok(mut guard)) = source.io.poll_read_ready(cx) {
                    guard.clear_ready();
                }
            }
            Direction::Write => {
                if let Poll::Ready(Ok(mut guard)) = source.io.poll_write_ready(cx) {
                    guard.clear_ready();
                }
            }
        }
    }
}

async fn with_timeout<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(timeout, fut).await.ok()
}

impl<T> fmt::Debug for Reactor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("sources", &self.sources.len())
            .field("watches", &self.by_fd.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}
