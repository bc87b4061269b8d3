//! HDLC-like framing of diag messages on byte streams.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::crc::crc16;

/// Terminates every frame.
pub const DELIMITER: u8 = 0x7E;
/// Precedes an escaped reserved octet.
pub const ESCAPE: u8 = 0x7D;
/// Escaped octets are XORed with this value.
pub const ESCAPE_XOR: u8 = 0x20;
/// Length of the CRC trailer.
pub const CRC_LEN: usize = 2;
/// Default maximum payload size of a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// Errors produced while decoding a frame. Apart from [`FrameError::Io`], every error consumes
/// the offending frame only; the codec stays usable and the next call continues with the
/// following frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: computed {expected:#06x}, trailer {actual:#06x}")]
    Crc { expected: u16, actual: u16 },
    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),
    #[error("frame of {len} bytes exceeds the maximum of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("frame of {0} bytes is too short to carry a trailer")]
    Truncated(usize),
}

impl FrameError {
    /// Returns `true` if only the current frame was lost.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Incremental codec for delimiter-terminated, escaped frames with a CRC-16 trailer.
///
/// Decoding is restartable: bytes of an incomplete frame stay in the source buffer between
/// calls, so feeding a stream in arbitrary chunks yields the same frames.
#[derive(Debug)]
pub struct HdlcCodec {
    /// Maximum payload size, excluding the trailer.
    max_frame_size: usize,
    /// Bytes of the source buffer already searched for a delimiter.
    scanned: usize,
    /// Set after an oversized frame was dropped; bytes are skipped up to the next delimiter.
    discarding: bool,
}

impl Default for HdlcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HdlcCodec {
    /// Creates a codec accepting frames up to [`DEFAULT_MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a codec accepting payloads up to `max_frame_size` bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size, scanned: 0, discarding: false }
    }

    /// Returns the largest accepted payload.
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Upper bound of the encoded size of a valid frame, excluding the delimiter.
    #[inline]
    fn max_encoded_len(&self) -> usize {
        2 * (self.max_frame_size + CRC_LEN)
    }

    /// Unescapes a frame without its delimiter and verifies the trailer.
    fn unframe(&self, raw: &[u8]) -> Result<Bytes, FrameError> {
        let mut frame = BytesMut::with_capacity(raw.len());
        let mut iter = raw.iter().enumerate();

        while let Some((offset, &byte)) = iter.next() {
            if byte != ESCAPE {
                frame.put_u8(byte);
                continue;
            }

            match iter.next() {
                Some((_, &next)) if matches!(next ^ ESCAPE_XOR, DELIMITER | ESCAPE) => {
                    frame.put_u8(next ^ ESCAPE_XOR)
                }
                _ => return Err(FrameError::InvalidEscape(offset)),
            }
        }

        if frame.len() > self.max_frame_size + CRC_LEN {
            return Err(FrameError::TooLarge {
                len: frame.len() - CRC_LEN,
                max: self.max_frame_size,
            });
        }
        if frame.len() <= CRC_LEN {
            return Err(FrameError::Truncated(frame.len()));
        }

        let trailer = frame.split_off(frame.len() - CRC_LEN);
        let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
        let expected = crc16(&frame);
        if expected != actual {
            return Err(FrameError::Crc { expected, actual });
        }

        Ok(frame.freeze())
    }
}

impl Decoder for HdlcCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|&b| b == DELIMITER) else {
                if self.discarding {
                    src.clear();
                    self.scanned = 0;
                    return Ok(None);
                }

                if src.len() > self.max_encoded_len() {
                    let len = src.len();
                    src.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Err(FrameError::TooLarge { len, max: self.max_frame_size });
                }

                self.scanned = src.len();
                return Ok(None);
            };

            let raw = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                trace!("resynchronized after oversized frame");
                continue;
            }

            // Delimiters may also open a frame; an empty frame is just padding.
            if raw.len() == 1 {
                continue;
            }

            return self.unframe(&raw[..raw.len() - 1]).map(Some);
        }
    }
}

impl<'a> Encoder<&'a [u8]> for HdlcCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(FrameError::TooLarge { len: item.len(), max: self.max_frame_size });
        }

        let crc = crc16(item).to_le_bytes();

        // Worst case every octet is escaped.
        dst.reserve(2 * (item.len() + CRC_LEN) + 1);

        for &byte in item.iter().chain(crc.iter()) {
            if byte == DELIMITER || byte == ESCAPE {
                dst.put_u8(ESCAPE);
                dst.put_u8(byte ^ ESCAPE_XOR);
            } else {
                dst.put_u8(byte);
            }
        }
        dst.put_u8(DELIMITER);

        Ok(())
    }
}

impl Encoder<Bytes> for HdlcCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&[u8]>>::encode(self, &item[..], dst)
    }
}
