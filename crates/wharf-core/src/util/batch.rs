use std::time::{Duration, Instant};

/// Size/age batcher: items accumulate until either the batch is full or the
/// oldest item has waited `max_age`, at which point the batch is handed back
/// to the caller for flushing.
#[derive(Debug)]
pub struct Batcher<T> {
    max_items: usize,
    max_age: Duration,
    items: Vec<T>,
    opened_at: Option<Instant>,
}

impl<T> Batcher<T> {
    pub fn new(max_items: usize, max_age: Duration) -> Self {
        assert!(max_items > 0, "batch size must be positive");
        Self {
            max_items,
            max_age,
            items: Vec::new(),
            opened_at: None,
        }
    }

    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.push_at(item, Instant::now())
    }

    pub fn push_at(&mut self, item: T, now: Instant) -> Option<Vec<T>> {
        if self.items.is_empty() {
            self.opened_at = Some(now);
        }
        self.items.push(item);
        if self.items.len() >= self.max_items {
            return Some(self.take());
        }
        None
    }

    /// Returns the batch when the oldest buffered item has aged out.
    pub fn flush_due_at(&mut self, now: Instant) -> Option<Vec<T>> {
        match self.opened_at {
            Some(opened) if now.duration_since(opened) >= self.max_age => Some(self.take()),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Vec<T> {
        self.take()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn take(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.items)
    }
}
