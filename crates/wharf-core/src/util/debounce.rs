use std::time::{Duration, Instant};

/// Trailing-edge debouncer: `signal` marks activity, `ready` fires once the
/// quiet period has elapsed with no further signals, then re-arms.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    pending_since: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending_since: None,
        }
    }

    pub fn signal(&mut self) {
        self.signal_at(Instant::now());
    }

    pub fn signal_at(&mut self, now: Instant) {
        self.pending_since = Some(now);
    }

    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    pub fn ready_at(&mut self, now: Instant) -> bool {
        match self.pending_since {
            Some(last) if now.duration_since(last) >= self.quiet => {
                self.pending_since = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }
}
