//! Credit-based output flow control.
//!
//! The bridge is the bookkeeper: bytes broadcast to clients accrue as
//! pending credit, client `ack` frames pay it down. Crossing the high
//! watermark pauses the pty read pump; falling back to the low watermark
//! resumes it. The struct is pure — the bridge holds it behind its flow
//! lock and emits the returned event outside the lock.

const DEFAULT_LOW_WATERMARK: i64 = 512 * 1024;
const DEFAULT_HIGH_WATERMARK: i64 = 2 * 1024 * 1024;

/// What the caller should broadcast after a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    None,
    Pause,
    Resume,
}

#[derive(Debug)]
pub struct FlowController {
    low: i64,
    high: i64,
    pending: i64,
    paused: bool,
}

impl FlowController {
    /// Non-positive watermarks fall back to the defaults; an inverted pair
    /// is corrected to `low = max(1, high/2)`.
    pub fn new(low: i64, high: i64) -> Self {
        let mut low = if low <= 0 { DEFAULT_LOW_WATERMARK } else { low };
        let high = if high <= 0 { DEFAULT_HIGH_WATERMARK } else { high };
        if low > high {
            low = (high / 2).max(1);
        }
        Self {
            low,
            high,
            pending: 0,
            paused: false,
        }
    }

    pub fn on_sent(&mut self, n: usize) -> FlowEvent {
        if n == 0 {
            return FlowEvent::None;
        }
        self.pending += n as i64;
        if !self.paused && self.pending > self.high {
            self.paused = true;
            return FlowEvent::Pause;
        }
        FlowEvent::None
    }

    pub fn on_ack(&mut self, n: i64) -> FlowEvent {
        if n <= 0 {
            return FlowEvent::None;
        }
        self.pending = (self.pending - n).max(0);
        if self.paused && self.pending <= self.low {
            self.paused = false;
            return FlowEvent::Resume;
        }
        FlowEvent::None
    }

    /// Clear all credit. Invoked when the last client disconnects so a later
    /// reconnect starts from a clean baseline.
    pub fn reset(&mut self) {
        self.pending = 0;
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[cfg(test)]
    fn pending(&self) -> i64 {
        self.pending
    }
}
