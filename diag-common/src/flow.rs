use std::{cell::Cell, fmt, rc::Rc};

/// Default number of outstanding buffers above which a flow throttles its source.
pub const DEFAULT_HIGH_WATER: usize = 64;

/// Default number of outstanding buffers below which a throttled flow resumes.
pub const DEFAULT_LOW_WATER: usize = 16;

/// Water marks of a [`Flow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOptions {
    /// The flow throttles once the outstanding counter exceeds this value.
    high_water: usize,
    /// A throttled flow resumes once the outstanding counter drops below this value.
    low_water: usize,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self { high_water: DEFAULT_HIGH_WATER, low_water: DEFAULT_LOW_WATER }
    }
}

impl FlowOptions {
    /// Sets the high-water mark.
    pub fn high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water;
        self
    }

    /// Sets the low-water mark.
    pub fn low_water(mut self, low_water: usize) -> Self {
        self.low_water = low_water;
        self
    }

    /// Returns the high-water mark.
    #[inline]
    pub fn high(&self) -> usize {
        self.high_water
    }

    /// Returns the low-water mark.
    #[inline]
    pub fn low(&self) -> usize {
        self.low_water
    }
}

struct Inner {
    outstanding: Cell<usize>,
    throttled: Cell<bool>,
    options: FlowOptions,
}

/// Accounting bucket for one producer/consumer relationship.
///
/// The outstanding counter always equals the number of live [`FlowCredit`]s, i.e. the number of
/// buffers enqueued on behalf of this flow that have not been released yet. Cloning a flow
/// shares the counter.
#[derive(Clone)]
pub struct Flow {
    inner: Rc<Inner>,
}

impl Flow {
    /// Creates a flow with nothing outstanding.
    ///
    /// # Panics
    /// Panics if the low-water mark is zero, since a throttled flow could then never resume,
    /// or if it is above the high-water mark.
    pub fn new(options: FlowOptions) -> Self {
        assert!(options.low_water > 0, "low-water mark must be at least 1");
        assert!(
            options.low_water <= options.high_water,
            "low-water mark {} above high-water mark {}",
            options.low_water,
            options.high_water
        );

        Self {
            inner: Rc::new(Inner {
                outstanding: Cell::new(0),
                throttled: Cell::new(false),
                options,
            }),
        }
    }

    /// Returns the number of buffers currently held on behalf of this flow.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.get()
    }

    /// Returns `true` while the source feeding this flow must not be read.
    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.inner.throttled.get()
    }

    /// Returns the water marks this flow was created with.
    #[inline]
    pub fn options(&self) -> FlowOptions {
        self.inner.options
    }

    /// Increments the outstanding counter. The returned credit decrements it again when dropped.
    pub fn acquire(&self) -> FlowCredit {
        let outstanding = self.inner.outstanding.get() + 1;
        self.inner.outstanding.set(outstanding);

        if outstanding > self.inner.options.high_water && !self.inner.throttled.replace(true) {
            tracing::debug!(outstanding, "flow above high-water mark, throttling");
        }

        FlowCredit { flow: self.clone() }
    }

    fn release(&self) {
        let outstanding = self.inner.outstanding.get();
        debug_assert!(outstanding > 0, "flow credit released twice");
        let outstanding = outstanding.saturating_sub(1);
        self.inner.outstanding.set(outstanding);

        if outstanding < self.inner.options.low_water && self.inner.throttled.replace(false) {
            tracing::debug!(outstanding, "flow below low-water mark, resuming");
        }
    }

    /// Returns `true` if both handles refer to the same flow.
    pub fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Flow {
    fn default() -> Self {
        Self::new(FlowOptions::default())
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("outstanding", &self.outstanding())
            .field("throttled", &self.is_throttled())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// One unit of outstanding volume on a [`Flow`]. Dropping the credit is the only way to
/// decrement the counter, so it happens exactly once.
#[derive(Debug)]
pub struct FlowCredit {
    flow: Flow,
}

impl FlowCredit {
    /// The flow this credit counts against.
    #[inline]
    pub fn flow(&self) -> &Flow {
        &self.flow
    }
}

impl Drop for FlowCredit {
    fn drop(&mut self) {
        self.flow.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_are_counted() {
        let flow = Flow::default();

        let a = flow.acquire();
        let b = flow.acquire();
        assert_eq!(flow.outstanding(), 2);

        drop(a);
        assert_eq!(flow.outstanding(), 1);
        drop(b);
        assert_eq!(flow.outstanding(), 0);
    }

    #[test]
    fn throttle_hysteresis() {
        let flow = Flow::new(FlowOptions::default().high_water(3).low_water(1));

        let mut credits: Vec<_> = (0..3).map(|_| flow.acquire()).collect();
        // At the mark, not above it.
        assert!(!flow.is_throttled());

        credits.push(flow.acquire());
        assert!(flow.is_throttled());

        // Between the marks the flow stays throttled.
        credits.truncate(2);
        assert_eq!(flow.outstanding(), 2);
        assert!(flow.is_throttled());
        credits.truncate(1);
        assert!(flow.is_throttled());

        credits.clear();
        assert!(!flow.is_throttled());
        assert_eq!(flow.outstanding(), 0);
    }

    #[test]
    fn clones_share_state() {
        let flow = Flow::default();
        let other = flow.clone();

        let _credit = other.acquire();
        assert_eq!(flow.outstanding(), 1);
        assert!(flow.same_as(&other));
        assert!(!flow.same_as(&Flow::default()));
    }

    #[test]
    #[should_panic]
    fn rejects_inverted_marks() {
        let _ = Flow::new(FlowOptions::default().high_water(1).low_water(2));
    }

    #[test]
    fn low_water_of_one_resumes_once_drained() {
        let flow = Flow::new(FlowOptions::default().high_water(1).low_water(1));

        let credits = [flow.acquire(), flow.acquire()];
        assert!(flow.is_throttled());

        drop(credits);
        assert_eq!(flow.outstanding(), 0);
        assert!(!flow.is_throttled());
    }

    #[test]
    #[should_panic(expected = "low-water mark must be at least 1")]
    fn zero_low_water_is_rejected() {
        Flow::new(FlowOptions::default().high_water(1).low_water(0));
    }
}
