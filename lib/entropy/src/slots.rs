//! Lock-free slot free list shared by the connection and session managers.
//!
//! A Treiber stack packed into one 64-bit atomic: the high 32 bits are an
//! ABA tag, the low 32 bits the head slot index. The tag is incremented on
//! every successful push and pop, so a head that was popped and re-pushed
//! between a competitor's load and CAS can never be mistaken for unchanged.
//! Per-slot `next` links live with the slots; the free list reads and writes
//! them through the accessors passed in by the owning manager.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel index marking "no slot" in both the head and the next links.
pub const INVALID_INDEX: u32 = u32::MAX;

#[inline]
fn pack(index: u32, tag: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn head_index(head: u64) -> u32 {
    (head & 0xFFFF_FFFF) as u32
}

#[inline]
fn head_tag(head: u64) -> u32 {
    (head >> 32) as u32
}

pub struct FreeList {
    head: AtomicU64,
}

impl FreeList {
    /// Builds a free list whose head starts at slot 0. The caller must have
    /// chained slot `i`'s next link to `i + 1` and the last slot to
    /// [`INVALID_INDEX`].
    pub fn with_all_free(capacity: usize) -> FreeList {
        let head = if capacity == 0 { INVALID_INDEX } else { 0 };
        FreeList {
            head: AtomicU64::new(pack(head, 0)),
        }
    }

    /// Pops a free slot index, reading each candidate's next link through
    /// `next_of`. Returns `None` when exhausted.
    pub fn pop<F: Fn(u32) -> u32>(&self, next_of: F) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = head_index(head);
            if index == INVALID_INDEX {
                return None;
            }

            let next = next_of(index);
            let new_head = pack(next, head_tag(head).wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(index),
                Err(current) => head = current,
            }
        }
    }

    /// Pushes a slot index back, storing the previous head into the slot's
    /// next link through `set_next` before each CAS attempt.
    pub fn push<F: Fn(u32, u32)>(&self, index: u32, set_next: F) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            set_next(index, head_index(head));
            let new_head = pack(index, head_tag(head).wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    struct Slots {
        next: Vec<AtomicU32>,
        free: FreeList,
    }

    impl Slots {
        fn new(capacity: usize) -> Slots {
            let next: Vec<AtomicU32> = (0..capacity)
                .map(|i| {
                    if i + 1 < capacity {
                        AtomicU32::new((i + 1) as u32)
                    } else {
                        AtomicU32::new(INVALID_INDEX)
                    }
                })
                .collect();
            Slots {
                next,
                free: FreeList::with_all_free(capacity),
            }
        }

        fn pop(&self) -> Option<u32> {
            self.free.pop(|i| self.next[i as usize].load(Ordering::Acquire))
        }

        fn push(&self, index: u32) {
            self.free
                .push(index, |i, next| self.next[i as usize].store(next, Ordering::Release));
        }
    }

    #[test]
    fn test_pop_exhausts_in_order() {
        let slots = Slots::new(3);
        assert_eq!(slots.pop(), Some(0));
        assert_eq!(slots.pop(), Some(1));
        assert_eq!(slots.pop(), Some(2));
        assert_eq!(slots.pop(), None);
    }

    #[test]
    fn test_push_makes_slot_reusable() {
        let slots = Slots::new(2);
        assert_eq!(slots.pop(), Some(0));
        assert_eq!(slots.pop(), Some(1));

        slots.push(1);
        assert_eq!(slots.pop(), Some(1));
        assert_eq!(slots.pop(), None);
    }

    #[test]
    fn test_zero_capacity_is_always_empty() {
        let slots = Slots::new(0);
        assert_eq!(slots.pop(), None);
    }

    #[test]
    fn test_concurrent_churn_never_duplicates_a_slot() {
        const CAPACITY: usize = 64;
        const THREADS: usize = 8;
        const ITERATIONS: usize = 2000;

        let slots = Arc::new(Slots::new(CAPACITY));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let slots = slots.clone();
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        if let Some(index) = slots.pop() {
                            // The popped slot is exclusively ours until pushed.
                            slots.push(index);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Every slot must be recoverable exactly once afterwards.
        let mut seen = vec![false; CAPACITY];
        while let Some(index) = slots.pop() {
            assert!(!seen[index as usize], "slot {} handed out twice", index);
            seen[index as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
