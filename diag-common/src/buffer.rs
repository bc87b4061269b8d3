use bytes::{Buf, BytesMut};

use crate::{Flow, FlowCredit};

/// A discrete unit of queued message data.
///
/// A buffer has a fixed capacity; its used length only grows through [`Buffer::reserve`]. The
/// bytes between the read cursor and the used length are exposed through [`Buf`], so a buffer
/// that was only partially written keeps its remaining bytes for the next write.
///
/// If the buffer was enqueued on behalf of a [`Flow`], it holds a [`FlowCredit`] that is
/// released when the buffer is dropped.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    capacity: usize,
    /// Read cursor into `data`.
    pos: usize,
    credit: Option<FlowCredit>,
}

impl Buffer {
    /// Allocates an empty buffer of the given capacity.
    pub fn alloc(capacity: usize) -> Self {
        Self { data: BytesMut::with_capacity(capacity), capacity, pos: 0, credit: None }
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn copy_from(data: &[u8]) -> Self {
        let mut buf = Self::alloc(data.len());
        buf.reserve(data.len()).copy_from_slice(data);
        buf
    }

    /// Extends the used length by `n` and returns the newly reserved region to fill.
    ///
    /// # Panics
    /// Panics if the used length would exceed the capacity.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        let used = self.data.len();
        assert!(
            used + n <= self.capacity,
            "buffer overflow: {used} + {n} exceeds capacity {}",
            self.capacity
        );

        self.data.resize(used + n, 0);
        &mut self.data[used..]
    }

    /// Returns the fixed capacity chosen at allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes filled so far, consumed or not.
    #[inline]
    pub fn used(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` once every filled byte has been consumed.
    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.pos == self.data.len()
    }

    /// Attributes this buffer to `flow`, incrementing its outstanding counter.
    ///
    /// # Panics
    /// Panics if the buffer is already attributed to a flow.
    pub(crate) fn attach(&mut self, flow: &Flow) {
        assert!(self.credit.is_none(), "buffer already attributed to a flow");
        self.credit = Some(flow.acquire());
    }

    /// Returns the flow this buffer is attributed to, if any.
    pub fn flow(&self) -> Option<&Flow> {
        self.credit.as_ref().map(FlowCredit::flow)
    }
}

impl Buf for Buffer {
    #[inline]
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining(), "cannot advance past the used length");
        self.pos += cnt;
    }
}
