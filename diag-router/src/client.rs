use std::{
    fmt,
    fs::File,
    io::{self, Read},
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{BytesCodec, Decoder, Encoder};
use tracing::warn;

use diag_common::{Flow, FlowOptions, Queue, Reactor, WatchId};
use diag_wire::{FrameError, HdlcCodec};

use crate::Token;

/// Identifies a client for the lifetime of the router. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Splits a client's input into messages.
#[derive(Debug)]
pub(crate) enum Parser {
    /// Byte stream of HDLC frames.
    Hdlc(HdlcCodec),
    /// Each read returns exactly one message.
    Raw { codec: BytesCodec, max_frame_size: usize },
}

impl Parser {
    fn new(framing: bool, max_frame_size: usize) -> Self {
        if framing {
            Self::Hdlc(HdlcCodec::with_max_frame_size(max_frame_size))
        } else {
            Self::Raw { codec: BytesCodec::new(), max_frame_size }
        }
    }
}

impl Decoder for Parser {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            Self::Hdlc(codec) => codec.decode(src),
            Self::Raw { codec, max_frame_size } => match codec.decode(src)? {
                Some(msg) if msg.len() > *max_frame_size => {
                    Err(FrameError::TooLarge { len: msg.len(), max: *max_frame_size })
                }
                msg => Ok(msg.map(BytesMut::freeze)),
            },
        }
    }
}

/// One connected diagnostic tool.
pub(crate) struct Client {
    pub(crate) id: ClientId,
    pub(crate) label: String,
    input: File,
    /// Separate output descriptor, if the transport has one.
    output: Option<File>,
    pub(crate) framing: bool,
    pub(crate) enabled: bool,
    pub(crate) queue: Queue,
    parser: Parser,
    /// Bytes read but not yet decoded.
    rx: BytesMut,
    /// Counts the buffers this client caused to be queued anywhere.
    pub(crate) flow: Flow,
    pub(crate) read_watch: Option<WatchId>,
    pub(crate) write_watch: Option<WatchId>,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        label: String,
        input: OwnedFd,
        output: Option<OwnedFd>,
        framing: bool,
        flow: FlowOptions,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            label,
            input: input.into(),
            output: output.map(File::from),
            framing,
            enabled: false,
            queue: Queue::new(),
            parser: Parser::new(framing, max_frame_size),
            rx: BytesMut::new(),
            flow: Flow::new(flow),
            read_watch: None,
            write_watch: None,
        }
    }

    pub(crate) fn input_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }

    pub(crate) fn output_fd(&self) -> RawFd {
        self.output.as_ref().unwrap_or(&self.input).as_raw_fd()
    }

    /// Queues a message for this client, framing it if needed, and arms the write watch.
    /// The buffer is attributed to `flow`, if given.
    pub(crate) fn send(&mut self, reactor: &mut Reactor<Token>, payload: &[u8], flow: Option<&Flow>) {
        let mut frame = BytesMut::new();
        let data = if self.framing {
            if let Err(e) = HdlcCodec::new().encode(payload, &mut frame) {
                warn!(client = %self.label, err = ?e, "dropping outgoing message");
                return;
            }
            &frame[..]
        } else {
            payload
        };

        match flow {
            Some(flow) => self.queue.push_with_flow(data, flow),
            None => self.queue.push(data),
        }

        if let Some(id) = self.write_watch {
            reactor.resume(id);
        }
    }

    /// Reads once into the parse buffer. Returns the number of bytes read.
    pub(crate) fn read(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.input.read(scratch) {
                Ok(n) => {
                    self.rx.extend_from_slice(&scratch[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Decodes the next complete message from the parse buffer.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        self.parser.decode(&mut self.rx)
    }

    /// Drains the output queue into the transport.
    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        let out = self.output.as_mut().unwrap_or(&mut self.input);
        if self.framing {
            self.queue.write_stream(out)
        } else {
            self.queue.write_messages(out)
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("fd", &self.input_fd())
            .field("framing", &self.framing)
            .field("enabled", &self.enabled)
            .field("queued", &self.queue.len())
            .field("flow", &self.flow)
            .finish()
    }
}
