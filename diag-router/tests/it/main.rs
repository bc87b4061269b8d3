use std::{
    fs::File,
    io::{self, Read},
    os::{fd::OwnedFd, unix::net::UnixStream},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use diag_common::Reactor;
use diag_router::{Router, Token};
use diag_wire::HdlcCodec;
use socket2::{Domain, Socket, Type};
use tokio_util::codec::{Decoder, Encoder};

mod backpressure;
mod listeners;
mod routing;

const TURN: Duration = Duration::from_millis(20);

/// Encodes a payload as one HDLC frame.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut dst = BytesMut::new();
    HdlcCodec::new().encode(payload, &mut dst).unwrap();
    dst.to_vec()
}

/// Runs `n` bounded reactor turns.
fn turns(reactor: &mut Reactor<Token>, router: &mut Router, n: usize) {
    for _ in 0..n {
        reactor.turn_timeout(router, TURN).unwrap();
    }
}

/// A non-blocking stream pair: the router's end and the tool's end.
fn stream_pair() -> (OwnedFd, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    theirs.set_nonblocking(true).unwrap();
    (ours.into(), theirs)
}

/// A non-blocking message-oriented pair: the router's end and the far end.
fn seqpacket_pair() -> (OwnedFd, File) {
    let (ours, theirs) = Socket::pair(Domain::UNIX, Type::SEQPACKET, None).unwrap();
    ours.set_nonblocking(true).unwrap();
    theirs.set_nonblocking(true).unwrap();
    (ours.into(), File::from(OwnedFd::from(theirs)))
}

/// Reads whatever is available without blocking. Each read is returned separately, which for
/// message-oriented descriptors is one message each.
fn read_available(src: &mut impl Read) -> Vec<Vec<u8>> {
    let mut reads = Vec::new();
    let mut buf = [0u8; 65536];

    loop {
        match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => reads.push(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }

    reads
}

/// Collects decoded frames from a stream until `count` arrived or a second passed, turning
/// the reactor in between.
fn expect_frames(
    reactor: &mut Reactor<Token>,
    router: &mut Router,
    src: &mut impl Read,
    count: usize,
) -> Vec<Vec<u8>> {
    let mut codec = HdlcCodec::new();
    let mut rx = BytesMut::new();
    let mut frames = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(1);

    while frames.len() < count && Instant::now() < deadline {
        turns(reactor, router, 1);
        for chunk in read_available(src) {
            rx.extend_from_slice(&chunk);
        }
        while let Some(frame) = codec.decode(&mut rx).unwrap() {
            frames.push(frame.to_vec());
        }
    }

    frames
}

/// Collects messages from a message-oriented descriptor until `count` arrived or a second
/// passed, turning the reactor in between.
fn expect_messages(
    reactor: &mut Reactor<Token>,
    router: &mut Router,
    src: &mut File,
    count: usize,
) -> Vec<Vec<u8>> {
    let mut msgs = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(1);

    while msgs.len() < count && Instant::now() < deadline {
        turns(reactor, router, 1);
        msgs.extend(read_available(src));
    }

    msgs
}
