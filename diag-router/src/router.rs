use std::{io, os::fd::OwnedFd};

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use diag_common::{Flow, Handler, Next, Reactor};
use diag_transport::Listener;

use crate::{
    client::{Client, ClientId},
    command::{command_key, CommandRegistry, Reply},
    peripheral::Peripheral,
    RouterError, RouterOptions,
};

/// Index of a listener registered with [`Router::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

/// Identifies what a reactor watch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// A listening socket with pending connections.
    Listener(ListenerId),
    /// Input from a client.
    ClientRx(ClientId),
    /// Room to flush a client's output queue.
    ClientTx(ClientId),
    /// A message from the modem.
    PeripheralRx,
    /// Room to flush the queue towards the modem.
    PeripheralTx,
}

/// Decides which clients receive a message coming from the peripheral.
pub trait BroadcastFilter {
    /// Returns `true` if the client `client`, labelled `label`, should receive `msg`.
    fn accept(&mut self, client: ClientId, label: &str, msg: &[u8]) -> bool;
}

/// Delivers every peripheral message to every enabled client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllClients;

impl BroadcastFilter for AllClients {
    fn accept(&mut self, _client: ClientId, _label: &str, _msg: &[u8]) -> bool {
        true
    }
}

/// Outcome of decoding the frames buffered by a client.
enum Decoded {
    /// Every complete frame was dispatched.
    Drained,
    /// The client's flow throttled; remaining bytes stay buffered.
    Throttled,
    /// The client went away while dispatching.
    Gone,
}

/// Owns the clients, listeners, peripheral and command registry of one router instance.
pub struct Router {
    options: RouterOptions,
    clients: FxHashMap<ClientId, Client>,
    next_client: u64,
    listeners: Vec<Listener>,
    peripheral: Option<Peripheral>,
    commands: CommandRegistry,
    filter: Box<dyn BroadcastFilter>,
    /// Read buffer shared by every descriptor.
    scratch: Vec<u8>,
}

impl Router {
    /// Creates a router without clients, listeners or peripheral.
    pub fn new(options: RouterOptions) -> Self {
        // Message-oriented reads must see one byte more than the limit to detect oversize.
        let scratch = vec![0; options.read_chunk.max(options.max_frame_size + 1)];

        Self {
            options,
            clients: FxHashMap::default(),
            next_client: 0,
            listeners: Vec::new(),
            peripheral: None,
            commands: CommandRegistry::new(),
            filter: Box::new(AllClients),
            scratch,
        }
    }

    /// Returns the options the router was created with.
    #[inline]
    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Replaces the policy selecting the recipients of peripheral output.
    pub fn set_broadcast_filter(&mut self, filter: impl BroadcastFilter + 'static) {
        self.filter = Box::new(filter);
    }

    /// Returns the registry of local command handlers.
    pub fn commands(&mut self) -> &mut CommandRegistry {
        &mut self.commands
    }

    /// Registers a listening socket. Each readiness event accepts one connection and adds it
    /// as an enabled client.
    pub fn add_listener(
        &mut self,
        reactor: &mut Reactor<Token>,
        listener: Listener,
    ) -> Result<ListenerId, RouterError> {
        let id = ListenerId(self.listeners.len());
        reactor.add_read_watch(&listener, Token::Listener(id))?;
        info!(kind = listener.label(), addr = ?listener.local_addr(), "listening");
        self.listeners.push(listener);

        Ok(id)
    }

    /// Creates a disabled client with an empty output queue. `output` defaults to `input`.
    pub fn add_client(
        &mut self,
        label: impl Into<String>,
        input: OwnedFd,
        output: Option<OwnedFd>,
        framing: bool,
    ) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;

        let client = Client::new(
            id,
            label.into(),
            input,
            output,
            framing,
            self.options.flow,
            self.options.max_frame_size,
        );
        debug!(client = %client.label, %id, fd = client.input_fd(), framing, "client added");
        self.clients.insert(id, client);

        id
    }

    /// Starts reading from a client and arms its (initially paused) write watch.
    pub fn enable_client(
        &mut self,
        reactor: &mut Reactor<Token>,
        id: ClientId,
    ) -> Result<(), RouterError> {
        let client = self.clients.get_mut(&id).ok_or(RouterError::UnknownClient(id))?;
        if client.enabled {
            return Ok(());
        }

        let read = reactor.add_read_watch_with_flow(
            &client.input_fd(),
            Token::ClientRx(id),
            client.flow.clone(),
        )?;
        let write = match reactor.add_write_watch(&client.output_fd(), Token::ClientTx(id)) {
            Ok(write) => write,
            Err(e) => {
                reactor.remove(read);
                return Err(e.into());
            }
        };

        if client.queue.is_empty() {
            reactor.pause(write);
        }

        client.read_watch = Some(read);
        client.write_watch = Some(write);
        client.enabled = true;
        info!(client = %client.label, %id, "client enabled");

        Ok(())
    }

    /// Tears a client down: removes its watches, releases its queue and closes its descriptors.
    /// Returns `false` if the client is unknown.
    pub fn remove_client(&mut self, reactor: &mut Reactor<Token>, id: ClientId) -> bool {
        let Some(client) = self.clients.remove(&id) else {
            return false;
        };

        for watch in [client.read_watch, client.write_watch].into_iter().flatten() {
            reactor.remove(watch);
        }

        info!(client = %client.label, %id, dropped = client.queue.len(), "client removed");
        true
    }

    /// Attaches the modem channel.
    pub fn set_peripheral(
        &mut self,
        reactor: &mut Reactor<Token>,
        fd: OwnedFd,
    ) -> Result<(), RouterError> {
        if self.peripheral.is_some() {
            return Err(RouterError::PeripheralAttached);
        }

        let mut peripheral = Peripheral::new(fd, self.options.flow);
        let read =
            reactor.add_read_watch_with_flow(&peripheral.fd(), Token::PeripheralRx, peripheral.flow.clone())?;
        let write = match reactor.add_write_watch(&peripheral.fd(), Token::PeripheralTx) {
            Ok(write) => write,
            Err(e) => {
                reactor.remove(read);
                return Err(e.into());
            }
        };
        reactor.pause(write);

        peripheral.read_watch = Some(read);
        peripheral.write_watch = Some(write);
        self.peripheral = Some(peripheral);

        Ok(())
    }

    /// Returns `true` while a peripheral is attached.
    pub fn has_peripheral(&self) -> bool {
        self.peripheral.is_some()
    }

    /// Queues `msg` for a single client, attributed to that client's flow.
    pub fn send_to(&mut self, reactor: &mut Reactor<Token>, id: ClientId, msg: &[u8]) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        let flow = client.flow.clone();
        client.send(reactor, msg, Some(&flow));
        true
    }

    /// Queues a copy of `msg` at every enabled client the broadcast filter accepts. Each copy
    /// counts against the peripheral's flow, or against no flow without a peripheral.
    /// Returns the number of recipients.
    ///
    /// A message is never split across a throttle decision: all copies are queued even if the
    /// flow crosses its high-water mark part way, so with `n` recipients the counter may end up
    /// to `n - 1` above the mark. The peripheral's read watch is masked before the next message.
    pub fn broadcast(&mut self, reactor: &mut Reactor<Token>, msg: &[u8]) -> usize {
        let flow = self.peripheral.as_ref().map(|peripheral| peripheral.flow.clone());

        let mut sent = 0;
        for client in self.clients.values_mut() {
            if !client.enabled || !self.filter.accept(client.id, &client.label, msg) {
                continue;
            }
            client.send(reactor, msg, flow.as_ref());
            sent += 1;
        }

        sent
    }

    /// Returns the number of clients, enabled or not.
    #[inline]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Iterates the ids of every client in no particular order.
    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    /// Returns the flow counting what `id` caused to be queued.
    pub fn client_flow(&self, id: ClientId) -> Option<&Flow> {
        self.clients.get(&id).map(|client| &client.flow)
    }

    /// Returns the flow counting queued peripheral output.
    pub fn peripheral_flow(&self) -> Option<&Flow> {
        self.peripheral.as_ref().map(|peripheral| &peripheral.flow)
    }

    /// Routes one frame from a client to a local handler, or else to the peripheral.
    fn dispatch(&mut self, reactor: &mut Reactor<Token>, id: ClientId, frame: &[u8]) {
        let Some(key) = command_key(frame) else { return };
        let Some(client) = self.clients.get_mut(&id) else { return };

        if let Some(handler) = self.commands.lookup(key) {
            let mut reply = Reply { client, reactor };
            handler(&mut reply, frame);
            return;
        }

        match self.peripheral {
            Some(ref mut peripheral) => peripheral.send(reactor, frame, &client.flow),
            None => debug!(client = %client.label, "no peripheral, dropping frame {key:#010x}"),
        }
    }

    /// Dispatches buffered frames until none is complete or the client's flow throttles.
    fn drain_frames(&mut self, reactor: &mut Reactor<Token>, id: ClientId) -> Decoded {
        loop {
            let Some(client) = self.clients.get_mut(&id) else {
                return Decoded::Gone;
            };
            if client.flow.is_throttled() {
                return Decoded::Throttled;
            }

            match client.next_frame() {
                Ok(Some(frame)) => self.dispatch(reactor, id, &frame),
                Ok(None) => return Decoded::Drained,
                Err(e) if e.is_recoverable() => {
                    warn!(client = %client.label, err = %e, "dropping frame");
                }
                Err(e) => {
                    error!(client = %client.label, err = ?e, "decode failed");
                    self.remove_client(reactor, id);
                    return Decoded::Gone;
                }
            }
        }
    }

    fn on_client_readable(&mut self, reactor: &mut Reactor<Token>, id: ClientId) -> Next {
        match self.drain_frames(reactor, id) {
            Decoded::Drained => {}
            Decoded::Throttled => return Next::Again,
            Decoded::Gone => return Next::Remove,
        }

        let Some(client) = self.clients.get_mut(&id) else {
            return Next::Remove;
        };

        match client.read(&mut self.scratch) {
            Ok(0) => {
                info!(client = %client.label, %id, "connection closed");
                self.remove_client(reactor, id);
                return Next::Remove;
            }
            Ok(n) => {
                debug!(client = %client.label, bytes = n, "read");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Wait,
            Err(e) => {
                warn!(client = %client.label, err = ?e, "read failed");
                self.remove_client(reactor, id);
                return Next::Remove;
            }
        }

        match self.drain_frames(reactor, id) {
            Decoded::Gone => Next::Remove,
            Decoded::Drained | Decoded::Throttled => Next::Again,
        }
    }

    fn on_client_writable(&mut self, reactor: &mut Reactor<Token>, id: ClientId) -> Next {
        let Some(client) = self.clients.get_mut(&id) else {
            return Next::Remove;
        };

        match client.flush() {
            Ok(_) => {
                if let Some(watch) = client.write_watch {
                    reactor.pause(watch);
                }
                Next::Again
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Next::Wait,
            Err(e) => {
                warn!(client = %client.label, err = ?e, "write failed");
                self.remove_client(reactor, id);
                Next::Remove
            }
        }
    }

    fn on_accept(&mut self, reactor: &mut Reactor<Token>, id: ListenerId) -> Next {
        let Some(listener) = self.listeners.get(id.0) else {
            return Next::Remove;
        };

        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Wait,
            Err(e) => {
                warn!(kind = listener.label(), err = ?e, "failed to accept");
                return Next::Again;
            }
        };

        info!(kind = conn.label, peer = %conn.peer, "accepting connection");
        let label = format!("{} {}", conn.label, conn.peer);
        let client = self.add_client(label, conn.fd, None, conn.framing);
        if let Err(e) = self.enable_client(reactor, client) {
            error!(err = ?e, "failed to enable client");
            self.remove_client(reactor, client);
        }

        Next::Again
    }

    fn on_peripheral_readable(&mut self, reactor: &mut Reactor<Token>) -> Next {
        let Some(ref mut peripheral) = self.peripheral else {
            return Next::Remove;
        };

        let n = match peripheral.read(&mut self.scratch) {
            Ok(0) => {
                warn!("peripheral closed");
                self.drop_peripheral(reactor);
                return Next::Remove;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Wait,
            Err(e) => {
                warn!(err = ?e, "peripheral read failed");
                self.drop_peripheral(reactor);
                return Next::Remove;
            }
        };

        if n > self.options.max_frame_size {
            warn!(len = n, max = self.options.max_frame_size, "dropping oversized peripheral message");
            return Next::Again;
        }

        let scratch = std::mem::take(&mut self.scratch);
        let recipients = self.broadcast(reactor, &scratch[..n]);
        self.scratch = scratch;
        debug!(len = n, recipients, "peripheral message");

        Next::Again
    }

    fn on_peripheral_writable(&mut self, reactor: &mut Reactor<Token>) -> Next {
        let Some(ref mut peripheral) = self.peripheral else {
            return Next::Remove;
        };

        match peripheral.flush() {
            Ok(_) => {
                if let Some(watch) = peripheral.write_watch {
                    reactor.pause(watch);
                }
                Next::Again
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Next::Wait,
            Err(e) => {
                warn!(err = ?e, "peripheral write failed");
                self.drop_peripheral(reactor);
                Next::Remove
            }
        }
    }

    /// Detaches the peripheral after it failed. Local commands keep being served.
    fn drop_peripheral(&mut self, reactor: &mut Reactor<Token>) {
        let Some(peripheral) = self.peripheral.take() else { return };

        for watch in [peripheral.read_watch, peripheral.write_watch].into_iter().flatten() {
            reactor.remove(watch);
        }
        warn!(dropped = peripheral.queue.len(), "peripheral detached");
    }
}

impl Handler for Router {
    type Token = Token;

    fn on_ready(&mut self, reactor: &mut Reactor<Token>, token: Token) -> Next {
        match token {
            Token::Listener(id) => self.on_accept(reactor, id),
            Token::ClientRx(id) => self.on_client_readable(reactor, id),
            Token::ClientTx(id) => self.on_client_writable(reactor, id),
            Token::PeripheralRx => self.on_peripheral_readable(reactor),
            Token::PeripheralTx => self.on_peripheral_writable(reactor),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("options", &self.options)
            .field("clients", &self.clients.len())
            .field("listeners", &self.listeners)
            .field("peripheral", &self.peripheral)
            .field("commands", &self.commands)
            .finish()
    }
}
