use std::{
    collections::VecDeque,
    io::{self, IoSlice, Write},
};

use bytes::Buf;

use crate::{Buffer, Flow};

/// The maximum number of slices to use in a vectored write.
const IOV_MAX: usize = 64;

/// Strict FIFO of [`Buffer`]s for one outbound direction.
///
/// Buffers leave the queue only through the drain methods, once fully written, or when the
/// queue is cleared or dropped. Either way the buffer is dropped exactly once, which releases
/// its flow credit.
#[derive(Debug, Default)]
pub struct Queue {
    buffers: VecDeque<Buffer>,
}

impl Queue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `data` into a new buffer and appends it to the tail.
    pub fn push(&mut self, data: &[u8]) {
        self.buffers.push_back(Buffer::copy_from(data));
    }

    /// Copies `data` into a new buffer attributed to `flow` and appends it to the tail. The
    /// flow's counter is incremented as part of this call.
    pub fn push_with_flow(&mut self, data: &[u8], flow: &Flow) {
        let mut buf = Buffer::copy_from(data);
        buf.attach(flow);
        self.buffers.push_back(buf);
    }

    /// Appends an already filled buffer to the tail.
    pub fn push_buffer(&mut self, buf: Buffer) {
        self.buffers.push_back(buf);
    }

    /// Returns the number of queued buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns `true` if no buffer is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Returns the number of bytes still to be written.
    pub fn remaining(&self) -> usize {
        self.buffers.iter().map(Buf::remaining).sum()
    }

    /// Returns the head of the queue without removing it.
    pub fn front(&self) -> Option<&Buffer> {
        self.buffers.front()
    }

    /// Removes and returns the head of the queue.
    pub fn pop(&mut self) -> Option<Buffer> {
        self.buffers.pop_front()
    }

    /// Releases every queued buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Writes as much of the queue as `writer` accepts as one byte stream, using vectored
    /// writes. Fully written buffers are released; a partially written head keeps its
    /// remaining bytes for the next call.
    ///
    /// Returns the number of bytes written once the queue is empty. Any error, including
    /// [`io::ErrorKind::WouldBlock`], is returned as is; bytes written before it stay consumed.
    pub fn write_stream<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        loop {
            while self.buffers.front().is_some_and(Buffer::is_consumed) {
                self.buffers.pop_front();
            }
            if self.buffers.is_empty() {
                break;
            }

            let mut slices = [IoSlice::new(&[]); IOV_MAX];
            let mut chunks_len = 0;

            for item in self.buffers.iter() {
                chunks_len += item.chunks_vectored(&mut slices[chunks_len..]);
                if chunks_len >= IOV_MAX {
                    break;
                }
            }

            let n = match writer.write_vectored(&slices[..chunks_len]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            total += n;
            self.consume(n);
        }

        Ok(total)
    }

    /// Writes the queue one buffer per write call, for descriptors that preserve message
    /// boundaries. A short write leaves the rest of the head buffer queued.
    pub fn write_messages<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while let Some(head) = self.buffers.front_mut() {
            let n = match writer.write(head.chunk()) {
                Ok(0) if head.has_remaining() => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            total += n;
            head.advance(n);
            if head.is_consumed() {
                self.buffers.pop_front();
            }
        }

        Ok(total)
    }

    /// Marks `n` bytes from the head of the queue as written.
    fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(item) = self.buffers.front_mut() else { break };
            let item_rem = item.remaining();

            if n >= item_rem {
                // The item is fully written, release it.
                self.buffers.pop_front();
                n -= item_rem;
            } else {
                item.advance(n);
                break;
            }
        }
    }
}
