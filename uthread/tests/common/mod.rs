#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

pub const TRACE_LEN: usize = 128;

/// A fixed-size, allocation-free log of thread indices.
///
/// Safe to append from the event hook and from preemptible thread code.
pub struct Trace {
    len: AtomicUsize,
    slots: [AtomicUsize; TRACE_LEN],
}

impl Trace {
    pub const fn new() -> Self {
        Self {
            len: AtomicUsize::new(0),
            slots: [const { AtomicUsize::new(usize::MAX) }; TRACE_LEN],
        }
    }

    pub fn push(&self, value: usize) {
        let at = self.len.fetch_add(1, Ordering::SeqCst);
        if let Some(slot) = self.slots.get(at) {
            slot.store(value, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> Vec<usize> {
        let len = self.len.load(Ordering::SeqCst).min(TRACE_LEN);
        self.slots[..len]
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .collect()
    }
}

/// Per-thread counters indexed by thread index.
pub struct Counters<const N: usize>([AtomicUsize; N]);

impl<const N: usize> Counters<N> {
    pub const fn new() -> Self {
        Self([const { AtomicUsize::new(0) }; N])
    }

    pub fn bump(&self, index: usize) {
        self.0[index].fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self, index: usize) -> usize {
        self.0[index].load(Ordering::SeqCst)
    }
}
