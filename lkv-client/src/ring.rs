//! # Slot Availability Ring
//!
//! Bounded multi-producer multi-consumer queue of free pool slot indices.
//! Checkout pops from it without taking any lock.
//!
//! ## Algorithm
//!
//! Each cell carries a sequence number. For a cell at position `pos`:
//! - `seq == pos`: empty, ready for the producer claiming `pos`.
//! - `seq == pos + 1`: full, ready for the consumer claiming `pos`.
//! - `seq == pos + capacity`: drained, ready for the next lap.
//!
//! Producers and consumers claim positions by CAS on `tail`/`head` and then
//! publish through the cell sequence.
//!
//! ## Memory Ordering
//!
//! - The value store happens-before the `Release` store of `seq = pos + 1`;
//!   a consumer's `Acquire` load of that sequence therefore sees the value.
//! - The consumer's `Release` store of `seq = pos + capacity` follows its value
//!   load; the next producer's `Acquire` load of the sequence keeps the new
//!   value store from racing with it.
//! - `head` and `tail` only arbitrate ownership of positions, so their CAS and
//!   loads are `Relaxed`; all data visibility flows through `seq`.

use std::sync::atomic::{AtomicUsize, Ordering};

struct Cell {
    seq: AtomicUsize,
    value: AtomicUsize,
}

/// Lock-free bounded queue of slot indices.
pub struct SlotRing {
    cells: Box<[Cell]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl SlotRing {
    /// Creates a ring holding at least `capacity` indices (rounded up to a
    /// power of two, minimum 2).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let cells = (0..capacity)
            .map(|pos| Cell {
                seq: AtomicUsize::new(pos),
                value: AtomicUsize::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SlotRing {
            cells,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Enqueues `value`; hands it back when the ring is full.
    pub fn push(&self, value: usize) -> Result<(), usize> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let lag = seq.wrapping_sub(pos) as isize;
            if lag == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.store(value, Ordering::Relaxed);
                        cell.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest index, or `None` when empty.
    pub fn pop(&self) -> Option<usize> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let lag = seq.wrapping_sub(pos.wrapping_add(1)) as isize;
            if lag == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = cell.value.load(Ordering::Relaxed);
                        cell.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of queued indices; exact when no push or pop is in flight.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.cells.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let ring = SlotRing::with_capacity(4);
        for idx in 0..4 {
            ring.push(idx).unwrap();
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.push(9), Err(9));
        for idx in 0..4 {
            assert_eq!(ring.pop(), Some(idx));
        }
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(SlotRing::with_capacity(5).cells.len(), 8);
        assert_eq!(SlotRing::with_capacity(0).cells.len(), 2);
    }

    #[test]
    fn wraps_around_many_laps() {
        let ring = SlotRing::with_capacity(2);
        for lap in 0..1_000 {
            ring.push(lap).unwrap();
            ring.push(lap + 1).unwrap();
            assert_eq!(ring.pop(), Some(lap));
            assert_eq!(ring.pop(), Some(lap + 1));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_indices_are_never_duplicated() {
        const SLOTS: usize = 16;
        let ring = Arc::new(SlotRing::with_capacity(SLOTS));
        for idx in 0..SLOTS {
            ring.push(idx).unwrap();
        }

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        if let Some(idx) = ring.pop() {
                            assert!(idx < SLOTS);
                            thread::yield_now();
                            ring.push(idx).expect("ring never overflows");
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(idx) = ring.pop() {
            assert!(seen.insert(idx), "slot {idx} queued twice");
        }
        assert_eq!(seen.len(), SLOTS);
    }
}
