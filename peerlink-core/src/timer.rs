//! Host-clock timers: a cancellable deadline, a retry schedule and a coalescing throttle.
//! Times are milliseconds on the host's clock; nothing here reads a clock itself.

/// A single cancellable deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timer {
    due: Option<u64>,
}

impl Timer {
    pub fn new() -> Self {
        Self { due: None }
    }

    /// (Re)arm to fire `delay` ms after `now`.
    pub fn arm(&mut self, now: u64, delay: u64) {
        self.due = Some(now.saturating_add(delay));
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    pub fn due(&self) -> Option<u64> {
        self.due
    }

    /// True once when the deadline has passed; the timer disarms itself.
    pub fn fire(&mut self, now: u64) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

/// Retry delays applied in order; the last delay repeats once the list is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<u64>,
}

impl RetrySchedule {
    /// An empty list falls back to a single 1s delay.
    pub fn new(delays: Vec<u64>) -> Self {
        if delays.is_empty() {
            return Self { delays: vec![1000] };
        }
        Self { delays }
    }

    pub fn delay(&self, attempt: usize) -> u64 {
        let i = attempt.min(self.delays.len() - 1);
        self.delays[i]
    }
}

/// Coalesces a stream of values to at most one emission per `interval`. A forced value is
/// always emitted immediately and drops anything pending.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval: u64,
    last_emit: Option<u64>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    /// Offer a value. Returns it when it may be emitted now; otherwise keeps it as the
    /// pending value (replacing any older one) for [`Throttle::flush`].
    pub fn offer(&mut self, now: u64, value: T, force: bool) -> Option<T> {
        if force || self.ready(now) {
            self.pending = None;
            self.last_emit = Some(now);
            return Some(value);
        }
        self.pending = Some(value);
        None
    }

    /// Emit the pending value if the interval has elapsed.
    pub fn flush(&mut self, now: u64) -> Option<T> {
        if self.pending.is_some() && self.ready(now) {
            self.last_emit = Some(now);
            return self.pending.take();
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn ready(&self, now: u64) -> bool {
        match self.last_emit {
            Some(last) => now.saturating_sub(last) >= self.interval,
            None => true,
        }
    }
}
