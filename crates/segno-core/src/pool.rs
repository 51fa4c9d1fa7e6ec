//! Fixed-capacity object pools.
//!
//! All per-event records on the real-time path (track entries, frame
//! states) come from pools sized up front, so steady-state operation never
//! allocates. A pool hands out opaque `u32` indices rather than pointers;
//! free slots are threaded into a list through their own storage. Running
//! a pool dry is a sizing bug and is fatal.

use std::ops::{Index, IndexMut};

use tracing::error;

enum Slot<T> {
    Free { next: Option<u32> },
    Used(T),
}

pub struct Pool<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: Option<u32>,
    used: usize,
}

impl<T> Pool<T> {
    pub fn new(name: &'static str, capacity: usize) -> Pool<T> {
        assert!(capacity > 0 && capacity <= u32::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity {
                Some(i as u32 + 1)
            } else {
                None
            };
            slots.push(Slot::Free { next });
        }
        Pool {
            name,
            slots,
            free: Some(0),
            used: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Take a slot from the free list. Exhaustion is fatal: pools are
    /// sized statically and running dry means the sizing is wrong.
    pub fn alloc(&mut self, item: T) -> u32 {
        let Some(id) = self.free else {
            error!(pool = self.name, capacity = self.capacity(), "pool is empty");
            panic!("pool '{}' is empty", self.name);
        };
        match self.slots[id as usize] {
            Slot::Free { next } => self.free = next,
            Slot::Used(_) => unreachable!("free list points at a used slot"),
        }
        self.slots[id as usize] = Slot::Used(item);
        self.used += 1;
        id
    }

    /// Return a slot to the free list. Freeing twice is fatal.
    pub fn free(&mut self, id: u32) -> T {
        let slot = std::mem::replace(
            &mut self.slots[id as usize],
            Slot::Free { next: self.free },
        );
        match slot {
            Slot::Used(item) => {
                self.free = Some(id);
                self.used -= 1;
                item
            }
            Slot::Free { .. } => {
                error!(pool = self.name, id, "double free");
                panic!("pool '{}': double free of slot {}", self.name, id);
            }
        }
    }

    pub fn get(&self, id: u32) -> &T {
        match &self.slots[id as usize] {
            Slot::Used(item) => item,
            Slot::Free { .. } => panic!("pool '{}': use of freed slot {}", self.name, id),
        }
    }

    pub fn get_mut(&mut self, id: u32) -> &mut T {
        match &mut self.slots[id as usize] {
            Slot::Used(item) => item,
            Slot::Free { .. } => panic!("pool '{}': use of freed slot {}", self.name, id),
        }
    }
}

impl<T> Index<u32> for Pool<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: u32) -> &T {
        self.get(id)
    }
}

impl<T> IndexMut<u32> for Pool<T> {
    #[inline]
    fn index_mut(&mut self, id: u32) -> &mut T {
        self.get_mut(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_cycle() {
        let mut pool: Pool<u64> = Pool::new("test", 4);
        let a = pool.alloc(1);
        let b = pool.alloc(2);
        assert_ne!(a, b);
        assert_eq!(pool.used(), 2);
        assert_eq!(pool[a], 1);
        assert_eq!(pool.free(a), 1);
        assert_eq!(pool.used(), 1);
        let c = pool.alloc(3);
        assert_eq!(pool[c], 3);
        assert_eq!(pool[b], 2);
    }

    #[test]
    fn test_no_aliasing_at_capacity() {
        let mut pool: Pool<u32> = Pool::new("test", 64);
        let mut ids = Vec::new();
        for i in 0..64 {
            ids.push(pool.alloc(i));
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 64, "alloc returned aliasing ids");
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(pool[*id], i as u32);
        }
    }

    #[test]
    fn test_interleaved_churn_never_aliases() {
        let mut pool: Pool<usize> = Pool::new("test", 8);
        let mut live = Vec::new();
        for round in 0..100 {
            if round % 3 == 0 && !live.is_empty() {
                let id = live.swap_remove(round % live.len());
                pool.free(id);
            } else if live.len() < 8 {
                let id = pool.alloc(round);
                assert!(!live.contains(&id));
                live.push(id);
            }
        }
        assert_eq!(pool.used(), live.len());
    }

    #[test]
    #[should_panic(expected = "is empty")]
    fn test_exhaustion_is_fatal() {
        let mut pool: Pool<u8> = Pool::new("test", 1);
        pool.alloc(0);
        pool.alloc(1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let mut pool: Pool<u8> = Pool::new("test", 2);
        let a = pool.alloc(0);
        pool.free(a);
        pool.free(a);
    }

    #[test]
    #[should_panic(expected = "use of freed slot")]
    fn test_use_after_free_is_fatal() {
        let mut pool: Pool<u8> = Pool::new("test", 2);
        let a = pool.alloc(0);
        pool.free(a);
        let _ = pool.get(a);
    }
}
