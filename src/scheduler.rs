//! Deterministic, cancellable timers.
//!
//! The engine never sleeps on its own: every component that needs a delayed
//! action (subscription teardown, poof swap, selection clear, disconnect
//! grace) schedules an event here and receives it back from
//! [`Scheduler::drain_due`] once the host advances time past its deadline.
//! The host drives time with explicit [`Instant`]s, which keeps tests exact.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Handle to one scheduled event. Valid until the event fires or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug)]
pub struct Scheduler<E> {
    next_id: u64,
    queue: BTreeMap<(Instant, u64), E>,
    deadlines: HashMap<u64, Instant>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, at: Instant, event: E) -> TimerHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.queue.insert((at, id), event);
        self.deadlines.insert(id, at);
        TimerHandle(id)
    }

    pub fn schedule_after(&mut self, now: Instant, delay: Duration, event: E) -> TimerHandle {
        self.schedule(now + delay, event)
    }

    /// Cancel a pending event, returning it if it had not fired yet.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<E> {
        let at = self.deadlines.remove(&handle.0)?;
        self.queue.remove(&(at, handle.0))
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.deadlines.get(&handle.0).copied()
    }

    /// Pop the earliest event whose deadline is `<= now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, E)> {
        let (&(at, id), _) = self.queue.first_key_value()?;
        if at > now {
            return None;
        }
        let event = self.queue.remove(&(at, id))?;
        self.deadlines.remove(&id);
        Some((TimerHandle(id), event))
    }

    /// All due events in deadline order; ties fire in scheduling order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<(TimerHandle, E)> {
        let mut due = Vec::new();
        while let Some(item) = self.pop_due(now) {
            due.push(item);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every pending event.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn events_fire_in_deadline_order() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.schedule_after(t0, ms(30), "c");
        s.schedule_after(t0, ms(10), "a");
        s.schedule_after(t0, ms(10), "b");

        assert!(s.drain_due(t0 + ms(5)).is_empty());
        let fired: Vec<_> = s.drain_due(t0 + ms(10)).into_iter().map(|(_, e)| e).collect();
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(s.next_deadline(), Some(t0 + ms(30)));
    }

    #[test]
    fn cancelled_event_never_fires() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        let h = s.schedule_after(t0, ms(10), 1);
        assert!(s.is_pending(h));
        assert_eq!(s.cancel(h), Some(1));
        assert!(!s.is_pending(h));
        assert_eq!(s.cancel(h), None);
        assert!(s.drain_due(t0 + ms(100)).is_empty());
    }

    #[test]
    fn fired_handle_is_no_longer_pending() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        let h = s.schedule_after(t0, ms(1), ());
        assert_eq!(s.pop_due(t0 + ms(1)).map(|(h, _)| h), Some(h));
        assert!(!s.is_pending(h));
        assert!(s.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.schedule_after(t0, ms(1), 'x');
        s.schedule_after(t0, ms(2), 'y');
        s.clear();
        assert_eq!(s.len(), 0);
        assert_eq!(s.next_deadline(), None);
    }
}
