//! Scheduled callbacks on the engine clock.
//!
//! A queue of tokens ordered by absolute expiry, driven by the elapsed
//! 1/24 µs deltas from the timer. All arithmetic is unsigned 32-bit
//! modulo 2^32 with signed comparison of differences, so the queue keeps
//! working across the three-minute wrap of the absolute clock. Expired
//! tokens are popped one at a time, which lets the dispatcher re-arm a
//! token from inside its own handling.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ent<T> {
    val: u32,
    tok: T,
}

#[derive(Debug, Default)]
pub struct TimoQueue<T> {
    abstime: u32,
    queue: VecDeque<Ent<T>>,
}

impl<T: PartialEq> TimoQueue<T> {
    pub fn new() -> TimoQueue<T> {
        TimoQueue {
            abstime: 0,
            queue: VecDeque::new(),
        }
    }

    /// Current absolute time, modulo 2^32.
    pub fn abstime(&self) -> u32 {
        self.abstime
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Schedule `tok` to expire in `delta` units. A zero delta is
    /// forbidden: it would race ordering against timeouts expiring at the
    /// current instant.
    pub fn add(&mut self, tok: T, delta: u32) {
        assert!(delta != 0, "zero timeout is evil");
        let val = self.abstime.wrapping_add(delta);
        let at = self
            .queue
            .iter()
            .position(|e| e.val.wrapping_sub(val) as i32 > 0)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, Ent { val, tok });
    }

    /// Abort a scheduled timeout. Removing one that already expired is a
    /// no-op; returns whether something was removed.
    pub fn del(&mut self, tok: &T) -> bool {
        match self.queue.iter().position(|e| e.tok == *tok) {
            Some(at) => {
                self.queue.remove(at);
                true
            }
            None => false,
        }
    }

    /// Advance the clock by `delta` units. Call [`TimoQueue::pop_expired`]
    /// afterwards until it returns `None`.
    pub fn advance(&mut self, delta: u32) {
        self.abstime = self.abstime.wrapping_add(delta);
    }

    /// Pop the next expired token, if any. Re-arming from the caller's
    /// dispatch loop is fine.
    pub fn pop_expired(&mut self) -> Option<T> {
        let head = self.queue.front()?;
        if head.val.wrapping_sub(self.abstime) as i32 <= 0 {
            self.queue.pop_front().map(|e| e.tok)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &mut TimoQueue<u32>) -> Vec<u32> {
        let mut fired = Vec::new();
        while let Some(tok) = q.pop_expired() {
            fired.push(tok);
        }
        fired
    }

    #[test]
    fn test_fire_in_order() {
        let mut q = TimoQueue::new();
        q.add(2, 200);
        q.add(1, 100);
        q.add(3, 300);
        q.advance(150);
        assert_eq!(drain(&mut q), vec![1]);
        q.advance(200);
        assert_eq!(drain(&mut q), vec![2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_same_expiry_fires_in_add_order() {
        let mut q = TimoQueue::new();
        q.add(1, 100);
        q.add(2, 100);
        q.advance(100);
        assert_eq!(drain(&mut q), vec![1, 2]);
    }

    #[test]
    fn test_del_pending_and_expired() {
        let mut q = TimoQueue::new();
        q.add(1, 100);
        q.add(2, 200);
        assert!(q.del(&1));
        q.advance(300);
        assert_eq!(drain(&mut q), vec![2]);
        // already fired: no-op
        assert!(!q.del(&2));
    }

    #[test]
    fn test_rearm_while_draining() {
        let mut q = TimoQueue::new();
        q.add(1, 100);
        q.advance(100);
        let mut fired = 0;
        while let Some(tok) = q.pop_expired() {
            fired += 1;
            if fired == 1 {
                assert_eq!(tok, 1);
                q.add(1, 50);
            }
        }
        assert_eq!(fired, 1);
        q.advance(50);
        assert_eq!(drain(&mut q), vec![1]);
    }

    #[test]
    fn test_ordering_across_wrap() {
        let mut q = TimoQueue::new();
        // park the clock just before the wrap point
        q.advance(u32::MAX - 999);
        q.add(1, 500);
        q.add(2, 1500);
        // expiries straddle the wrap; both fire, in order
        q.advance(2000);
        assert_eq!(drain(&mut q), vec![1, 2]);
        assert_eq!(q.abstime(), 1000);
    }

    #[test]
    fn test_every_timeout_fires_exactly_once_across_wrap() {
        let mut q = TimoQueue::new();
        q.advance(u32::MAX - 10);
        for i in 0..20u32 {
            q.add(i, (i + 1) * 3);
        }
        let mut fired = Vec::new();
        for _ in 0..30 {
            q.advance(3);
            fired.extend(drain(&mut q));
        }
        assert_eq!(fired, (0..20).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "zero timeout")]
    fn test_zero_delta_forbidden() {
        let mut q = TimoQueue::new();
        q.add(1, 0);
    }
}
