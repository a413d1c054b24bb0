//! Liveness: periodic heartbeat and a watchdog on inbound traffic; debounced typing flag.

use crate::timer::Timer;

/// Heartbeat sender plus inbound-silence watchdog for one data connection.
pub struct Liveness {
    interval: u64,
    window: u64,
    heartbeat: Timer,
    last_inbound: Option<u64>,
}

/// What [`Liveness::poll`] wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    Idle,
    SendHeartbeat,
    /// Nothing arrived within the window; the connection is presumed dead.
    Expired,
}

impl Liveness {
    pub fn new(interval: u64, window: u64) -> Self {
        Self {
            interval,
            window,
            heartbeat: Timer::new(),
            last_inbound: None,
        }
    }

    /// Start watching a freshly opened connection.
    pub fn start(&mut self, now: u64) {
        self.last_inbound = Some(now);
        self.heartbeat.arm(now, self.interval);
    }

    pub fn stop(&mut self) {
        self.last_inbound = None;
        self.heartbeat.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.last_inbound.is_some()
    }

    /// Any inbound traffic counts as a sign of life.
    pub fn touch(&mut self, now: u64) {
        if let Some(last) = self.last_inbound.as_mut() {
            *last = (*last).max(now);
        }
    }

    pub fn poll(&mut self, now: u64) -> Pulse {
        let Some(last) = self.last_inbound else {
            return Pulse::Idle;
        };
        if now.saturating_sub(last) > self.window {
            self.stop();
            return Pulse::Expired;
        }
        if self.heartbeat.fire(now) {
            self.heartbeat.arm(now, self.interval);
            return Pulse::SendHeartbeat;
        }
        Pulse::Idle
    }
}

/// Receiver-side "peer is typing" flag that clears itself after a quiet period.
pub struct TypingIndicator {
    timeout: u64,
    clear_at: Timer,
}

impl TypingIndicator {
    pub fn new(timeout: u64) -> Self {
        Self {
            timeout,
            clear_at: Timer::new(),
        }
    }

    /// A typing notification arrived; (re)start the quiet period.
    pub fn notify(&mut self, now: u64) {
        self.clear_at.arm(now, self.timeout);
    }

    pub fn is_typing(&self) -> bool {
        self.clear_at.is_armed()
    }

    /// True once when the quiet period elapses and the flag should clear.
    pub fn expired(&mut self, now: u64) -> bool {
        self.clear_at.fire(now)
    }

    pub fn reset(&mut self) {
        self.clear_at.cancel();
    }
}
