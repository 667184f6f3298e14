//! Ready queue.
//!
//! [`ReadyQueue`] is a fixed-capacity ring buffer of `C` slots with two
//! cursors: `head`, the slot the next push writes, and `tail`, the slot the
//! next pop reads. One slot is always left empty so that a full queue
//! (`(head + 1) % C == tail`) can be told apart from an empty one
//! (`head == tail`); at most `C - 1` items are stored at a time.
//!
//! The queue never allocates, so it can be used from the interrupt handler.

/// The queue has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// The queue holds no item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEmpty;

/// A first-in-first-out ring buffer with `C` slots.
#[derive(Debug)]
pub struct ReadyQueue<T: Copy, const C: usize> {
    head: usize,
    tail: usize,
    slots: [Option<T>; C],
}

impl<T: Copy, const C: usize> ReadyQueue<T, C> {
    const VALID: () = assert!(C >= 2, "a ready queue needs at least two slots");

    /// Creates an empty queue with both cursors at slot 0.
    pub const fn new() -> Self {
        let () = Self::VALID;
        Self {
            head: 0,
            tail: 0,
            slots: [None; C],
        }
    }

    /// Appends `item` at the head.
    ///
    /// # Returns
    /// - `Ok(())` if `item` is stored.
    /// - `Err(QueueFull)` if `C - 1` items are already stored. The queue is
    ///   left untouched.
    pub fn push(&mut self, item: T) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull);
        }
        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % C;
        Ok(())
    }

    /// Removes the oldest item from the tail.
    ///
    /// # Returns
    /// - `Ok(item)` with the item pushed earliest among the stored ones.
    /// - `Err(QueueEmpty)` if nothing is stored. The queue is left untouched.
    pub fn pop(&mut self) -> Result<T, QueueEmpty> {
        if self.is_empty() {
            return Err(QueueEmpty);
        }
        let item = self.slots[self.tail].take().ok_or(QueueEmpty)?;
        self.tail = (self.tail + 1) % C;
        Ok(item)
    }

    /// Returns true if no item is stored.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Returns true if another push would fail.
    pub fn is_full(&self) -> bool {
        (self.head + 1) % C == self.tail
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        (self.head + C - self.tail) % C
    }

    /// Maximum number of items stored at a time, `C - 1`.
    pub const fn capacity(&self) -> usize {
        C - 1
    }

    /// The `(head, tail)` cursors.
    pub fn cursors(&self) -> (usize, usize) {
        (self.head, self.tail)
    }
}

impl<T: Copy, const C: usize> Default for ReadyQueue<T, C> {
    fn default() -> Self {
        Self::new()
    }
}
