// fixed-capacity circular store with resize-on-demand. underlies every
// buffer policy and every per-channel instruction queue.

use super::error::{Error, Result, MAX_QUEUE_SIZE};

/// Circular FIFO buffer of `T`
///
/// Elements enter at the head (`push_front`) and leave at the tail
/// (`pop_back`), oldest first. `push_front` assumes a free slot; use
/// [`bounded_push_front`](Self::bounded_push_front) for grow-on-demand with
/// the per-channel hard ceiling.
pub struct RingBuffer<T> {
    // next write position
    head: usize,
    // next read position; if len > 0 the oldest element is arr[tail]
    tail: usize,
    len: usize,
    arr: Vec<Option<T>>,
}

impl<T> RingBuffer<T> {
    /// Construct with the given capacity. Zero capacity is a configuration
    /// error.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let mut arr = Vec::with_capacity(capacity);
        arr.resize_with(capacity, || None);
        Ok(RingBuffer { head: 0, tail: 0, len: 0, arr })
    }

    /// Elements currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current slot capacity (grows and shrinks over the buffer's life).
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.arr.len()
    }

    /// Push an element at the head. A free slot must exist.
    pub fn push_front(&mut self, elem: T) {
        debug_assert!(self.len < self.arr.len(), "push_front into full ring (internal bug)");
        self.arr[self.head] = Some(elem);
        self.head = (self.head + 1) % self.arr.len();
        self.len += 1;
    }

    /// Push at the head, doubling the backing store when full.
    ///
    /// Fails with [`Error::Backpressure`] past [`MAX_QUEUE_SIZE`] pending
    /// entries; this is the guard against unbounded growth from runaway
    /// producers.
    pub fn bounded_push_front(&mut self, elem: T) -> Result<()> {
        if self.len >= MAX_QUEUE_SIZE {
            return Err(Error::Backpressure);
        }
        if self.len + 1 >= self.arr.len() {
            self.resize(false);
        }
        self.push_front(elem);
        Ok(())
    }

    /// Pop the oldest element from the tail.
    pub fn pop_back(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let elem = self.arr[self.tail].take();
        self.tail = (self.tail + 1) % self.arr.len();
        self.len -= 1;
        elem
    }

    /// Peek the oldest element without removing it.
    pub fn peek_back(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.arr[self.tail].as_ref()
    }

    /// Resize the backing store: doubled when growing, `len + 1` when
    /// shrinking. Preserves FIFO order across the wraparound boundary.
    pub fn resize(&mut self, down: bool) {
        let new_cap = if down { self.len + 1 } else { self.arr.len() * 2 };
        let mut new_arr = Vec::with_capacity(new_cap);
        new_arr.resize_with(new_cap, || None);
        for slot in new_arr.iter_mut().take(self.len) {
            let idx = self.tail;
            self.tail = (self.tail + 1) % self.arr.len();
            *slot = self.arr[idx].take();
        }
        self.tail = 0;
        self.head = self.len % new_cap;
        self.arr = new_arr;
    }

    /// Compact in place, keeping only elements satisfying the predicate.
    ///
    /// The predicate sees elements oldest-first with their iteration index,
    /// matching [`iter`](Self::iter). Shrinks the backing store if anything
    /// was removed.
    pub fn cleanup(&mut self, mut predicate: impl FnMut(&T, usize) -> bool) {
        let before = self.len;
        for i in 0..before {
            let elem = self.pop_back().expect("ring shorter than len (internal bug)");
            if predicate(&elem, i) {
                self.push_front(elem);
            }
        }
        if self.len < before {
            self.resize(true);
        }
    }

    /// Iterate oldest-first without removing.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len).map(move |i| {
            self.arr[(self.tail + i) % self.arr.len()]
                .as_ref()
                .expect("hole inside ring window (internal bug)")
        })
    }

    /// Iterate oldest-first with mutable access.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        let cap = self.arr.len();
        let (wrapped, linear) = if self.tail + self.len <= cap {
            let (_, rest) = self.arr.split_at_mut(self.tail);
            let (window, _) = rest.split_at_mut(self.len);
            (&mut [][..], window)
        } else {
            let (front, back) = self.arr.split_at_mut(self.tail);
            (&mut front[..self.head], back)
        };
        linear
            .iter_mut()
            .chain(wrapped.iter_mut())
            .map(|slot| slot.as_mut().expect("hole inside ring window (internal bug)"))
    }

    /// Pop every element, oldest-first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(elem) = self.pop_back() {
            out.push(elem);
        }
        out
    }
}
