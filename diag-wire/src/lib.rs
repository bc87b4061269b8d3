//! Wire formats spoken between the router and diagnostic tools.
//!
//! Byte-stream transports carry [`hdlc`] frames: the payload followed by a CRC-16 trailer,
//! escaped and terminated by a delimiter octet. Message-oriented transports carry the bare
//! payload and use [`tokio_util::codec::BytesCodec`].

pub mod crc;
pub mod hdlc;

pub use hdlc::{FrameError, HdlcCodec};
