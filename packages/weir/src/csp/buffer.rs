// buffer policies: admission and eviction rules over one ring buffer.

use super::{error::Result, ring::RingBuffer, value::Value};

/// Buffering policy backing a channel
///
/// Each policy owns one [`RingBuffer`] and decides what happens when a value
/// arrives at capacity:
///
/// - `Fixed(n)` reports full at `n` but still accepts while full (callers
///   are expected to check `is_full` before producing; the tolerance lets a
///   transform step expand one input into several stored values).
/// - `Sliding(n)` never reports full; at capacity it evicts the oldest value
///   and inserts the new one.
/// - `Dropping(n)` never reports full; at capacity it silently discards the
///   new value.
pub enum Policy {
    Fixed { ring: RingBuffer<Value>, n: usize },
    Sliding { ring: RingBuffer<Value>, n: usize },
    Dropping { ring: RingBuffer<Value>, n: usize },
}

impl Policy {
    pub fn fixed(n: usize) -> Result<Self> {
        Ok(Policy::Fixed { ring: RingBuffer::new(n)?, n })
    }

    pub fn sliding(n: usize) -> Result<Self> {
        Ok(Policy::Sliding { ring: RingBuffer::new(n)?, n })
    }

    pub fn dropping(n: usize) -> Result<Self> {
        Ok(Policy::Dropping { ring: RingBuffer::new(n)?, n })
    }

    /// Whether the policy considers itself full. Only `Fixed` ever does.
    pub fn is_full(&self) -> bool {
        match self {
            Policy::Fixed { ring, n } => ring.len() >= *n,
            Policy::Sliding { .. } | Policy::Dropping { .. } => false,
        }
    }

    /// Admit a value under the policy's rules.
    ///
    /// `Fixed` grows past `n` on demand and can fail with backpressure at
    /// the hard ceiling; the other policies never fail.
    pub fn add(&mut self, value: Value) -> Result<()> {
        match self {
            Policy::Fixed { ring, .. } => ring.bounded_push_front(value),
            Policy::Sliding { ring, n } => {
                if ring.len() == *n {
                    ring.pop_back();
                }
                ring.push_front(value);
                Ok(())
            }
            Policy::Dropping { ring, n } => {
                if ring.len() != *n {
                    ring.push_front(value);
                }
                Ok(())
            }
        }
    }

    /// Pop the oldest stored value.
    pub fn remove(&mut self) -> Option<Value> {
        self.ring_mut().pop_back()
    }

    /// Peek the oldest stored value without removing.
    pub fn last(&self) -> Option<&Value> {
        self.ring().peek_back()
    }

    pub fn count(&self) -> usize {
        self.ring().len()
    }

    fn ring(&self) -> &RingBuffer<Value> {
        match self {
            Policy::Fixed { ring, .. }
            | Policy::Sliding { ring, .. }
            | Policy::Dropping { ring, .. } => ring,
        }
    }

    fn ring_mut(&mut self) -> &mut RingBuffer<Value> {
        match self {
            Policy::Fixed { ring, .. }
            | Policy::Sliding { ring, .. }
            | Policy::Dropping { ring, .. } => ring,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_accepts_while_full() {
        let mut buf = Policy::fixed(2).unwrap();
        buf.add(Value::Int(1)).unwrap();
        buf.add(Value::Int(2)).unwrap();
        assert!(buf.is_full());
        // overflow-tolerant: still stores, still reports full
        buf.add(Value::Int(3)).unwrap();
        assert!(buf.is_full());
        assert_eq!(buf.count(), 3);
        assert_eq!(buf.remove(), Some(Value::Int(1)));
    }

    #[test]
    fn sliding_evicts_oldest() {
        let mut buf = Policy::sliding(3).unwrap();
        for i in 1..=5 {
            buf.add(Value::Int(i)).unwrap();
        }
        assert!(!buf.is_full());
        assert_eq!(buf.count(), 3);
        // most recent n survive, in insertion order
        assert_eq!(buf.remove(), Some(Value::Int(3)));
        assert_eq!(buf.remove(), Some(Value::Int(4)));
        assert_eq!(buf.remove(), Some(Value::Int(5)));
    }

    #[test]
    fn dropping_discards_new() {
        let mut buf = Policy::dropping(3).unwrap();
        for i in 1..=5 {
            buf.add(Value::Int(i)).unwrap();
        }
        assert!(!buf.is_full());
        assert_eq!(buf.count(), 3);
        // the first n survive, later arrivals were discarded
        assert_eq!(buf.remove(), Some(Value::Int(1)));
        assert_eq!(buf.remove(), Some(Value::Int(2)));
        assert_eq!(buf.remove(), Some(Value::Int(3)));
    }

    #[test]
    fn zero_capacity_fails_at_construction() {
        assert!(Policy::fixed(0).is_err());
        assert!(Policy::sliding(0).is_err());
        assert!(Policy::dropping(0).is_err());
    }
}
