//! One-shot timers for the protocol state machines.
//!
//! This is a cooperative timer list, not a background thread: state
//! machines register and cancel deadlines, and the node's event loop asks
//! for [`next_deadline`](Timers::next_deadline), sleeps until it, and then
//! drains [`pop_expired`](Timers::pop_expired). Callbacks therefore run on
//! the same task as message handlers and can never pre-empt them.

use std::time::{Duration, Instant};

/// Identifies a registered timer, so it can be cancelled. Handles are never
/// reused within a `Timers` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Entry<E> {
    handle: TimerHandle,
    deadline: Instant,
    event: E,
}

/// A set of pending one-shot timeouts carrying events of type `E`.
#[derive(Debug)]
pub struct Timers<E> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

impl<E> Timers<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Registers `event` to fire after `delay`.
    pub fn register(&mut self, delay: Duration, event: E) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            handle,
            deadline: Instant::now() + delay,
            event,
        });
        handle
    }

    /// Cancels a timer. Cancelling an already-fired or already-cancelled
    /// handle is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.entries.retain(|entry| entry.handle != handle);
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    /// Removes and returns the earliest expired timer's event, or `None`
    /// if nothing has expired yet.
    pub fn pop_expired(&mut self, now: Instant) -> Option<E> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= now)
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(index, _)| index)?;
        Some(self.entries.swap_remove(index).event)
    }
}

impl<E> Default for Timers<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        A,
        B,
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        timers.register(Duration::from_millis(20), Event::B);
        timers.register(Duration::from_millis(10), Event::A);

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(timers.pop_expired(later), Some(Event::A));
        assert_eq!(timers.pop_expired(later), Some(Event::B));
        assert_eq!(timers.pop_expired(later), None);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut timers = Timers::new();
        let handle = timers.register(Duration::from_millis(1), Event::A);
        timers.cancel(handle);
        assert_eq!(timers.next_deadline(), None);
        assert_eq!(timers.pop_expired(Instant::now() + Duration::from_secs(1)), None);
    }

    #[test]
    fn nothing_expires_early() {
        let mut timers = Timers::new();
        timers.register(Duration::from_secs(60), Event::A);
        assert!(timers.next_deadline().is_some());
        assert_eq!(timers.pop_expired(Instant::now()), None);
    }
}
