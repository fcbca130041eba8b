//! Coalescing of live increments.
//!
//! `Idle → Accumulating { deadline, pending } → Committed { amount, at }`.
//! Every push moves the deadline to `now + window`; `poll` commits once the
//! deadline has passed.

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Accumulating { deadline_ms: u64, pending: u64 },
    Committed { amount: u64, at_ms: u64 },
}

#[derive(Clone, Debug)]
pub struct Debouncer {
    window_ms: u64,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            state: DebounceState::Idle,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Increments accumulated but not yet committed.
    pub fn pending(&self) -> u64 {
        match self.state {
            DebounceState::Accumulating { pending, .. } => pending,
            _ => 0,
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        match self.state {
            DebounceState::Accumulating { deadline_ms, .. } => Some(deadline_ms),
            _ => None,
        }
    }

    pub fn push(&mut self, now_ms: u64) {
        self.state = DebounceState::Accumulating {
            deadline_ms: now_ms.saturating_add(self.window_ms),
            pending: self.pending() + 1,
        };
    }

    /// Commit the accumulated amount if the quiet period has elapsed.
    pub fn poll(&mut self, now_ms: u64) -> Option<u64> {
        match self.state {
            DebounceState::Accumulating {
                deadline_ms,
                pending,
            } if now_ms >= deadline_ms => {
                self.state = DebounceState::Committed {
                    amount: pending,
                    at_ms: now_ms,
                };
                Some(pending)
            }
            _ => None,
        }
    }

    /// Drop up to `amount` pending increments without moving the deadline.
    pub fn retract(&mut self, amount: u64) {
        if let DebounceState::Accumulating {
            deadline_ms,
            pending,
        } = self.state
        {
            let left = pending.saturating_sub(amount);
            self.state = if left == 0 {
                DebounceState::Idle
            } else {
                DebounceState::Accumulating {
                    deadline_ms,
                    pending: left,
                }
            };
        }
    }

    pub fn clear(&mut self) {
        self.state = DebounceState::Idle;
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_MS)
    }
}
