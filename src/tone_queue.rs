// src/tone_queue.rs  —  bounded ring buffer of (duration, frequency) tones
//
// Pure data structure: no threads, no locking. The dispatcher owns one of
// these behind a `Mutex` and drives it from its worker thread; see
// `dispatcher.rs`. Kept as its own file/type because the queue's invariants
// (head/tail/full/empty, low-water crossing) are independent of how ticks
// are delivered.

use crate::error::{CwError, CwResult};

pub const CAPACITY: usize = 3000;
pub const HIGH_WATER: usize = 2900;

/// A single tone: `frequency_hz == 0` denotes silence. `duration_usec == 0`
/// is a legal "set state, no wait" directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tone {
    pub duration_usec: u64,
    pub frequency_hz: u32,
}

impl Tone {
    pub fn new(duration_usec: u64, frequency_hz: u32) -> Self {
        Self { duration_usec, frequency_hz }
    }

    pub fn is_silent(&self) -> bool {
        self.frequency_hz == 0
    }
}

/// Ring buffer over `[Tone; CAPACITY]` with one always-empty slot so that
/// `head == tail` unambiguously means empty: effective capacity is
/// `CAPACITY - 1`.
pub struct ToneQueue {
    buf: Vec<Tone>,
    head: usize,
    tail: usize,
    low_water_mark: Option<usize>,
}

impl ToneQueue {
    pub fn new() -> Self {
        Self {
            buf: vec![Tone::new(0, 0); CAPACITY],
            head: 0,
            tail: 0,
            low_water_mark: None,
        }
    }

    fn next(i: usize) -> usize {
        (i + 1) % CAPACITY
    }

    pub fn len(&self) -> usize {
        if self.tail >= self.head {
            self.tail - self.head
        } else {
            CAPACITY - self.head + self.tail
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        Self::next(self.tail) == self.head
    }

    pub fn capacity(&self) -> usize {
        CAPACITY - 1
    }

    /// Appends a tone; caller (the dispatcher) is responsible for the
    /// `Busy` check against the keyer/straight key, since the queue itself
    /// has no notion of those subsystems.
    pub fn push(&mut self, tone: Tone) -> CwResult<()> {
        if self.is_full() {
            return Err(CwError::queue_full());
        }
        self.buf[self.tail] = tone;
        self.tail = Self::next(self.tail);
        Ok(())
    }

    /// Pops the head tone. The returned `bool` is set exactly when this pop
    /// crosses `length` from `> level` to `<= level` — the caller (the
    /// dispatcher) owns the low-water callback and fires it, since invoking
    /// a callback from inside a data structure the caller is holding a lock
    /// over would run it under that lock too.
    pub fn pop(&mut self) -> (Option<Tone>, bool) {
        if self.is_empty() {
            return (None, false);
        }
        let before = self.len();
        let tone = self.buf[self.head];
        self.head = Self::next(self.head);
        let after = self.len();
        let crossed = match self.low_water_mark {
            Some(level) => before > level && after <= level,
            None => false,
        };
        (Some(tone), crossed)
    }

    pub fn peek(&self) -> Option<Tone> {
        if self.is_empty() {
            None
        } else {
            Some(self.buf[self.head])
        }
    }

    pub fn register_low_water(&mut self, level: Option<usize>) -> CwResult<()> {
        if let Some(l) = level {
            if l >= CAPACITY - 2 {
                return Err(CwError::invalid_argument(format!(
                    "low-water level {l} out of range [0, {})",
                    CAPACITY - 2
                )));
            }
        }
        self.low_water_mark = level;
        Ok(())
    }

    /// Drops all queued tones without reporting a low-water crossing — used
    /// by `flush`/`reset`, which silence the sink directly instead.
    pub fn clear(&mut self) {
        self.head = self.tail;
    }

    /// As `clear`, but also forgets the low-water registration (`reset`
    /// semantics per §4.2).
    pub fn reset(&mut self) {
        self.clear();
        self.low_water_mark = None;
    }
}

impl Default for ToneQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_iff_head_eq_tail() {
        let mut q = ToneQueue::new();
        assert!(q.is_empty());
        q.push(Tone::new(100, 600)).unwrap();
        assert!(!q.is_empty());
        q.pop().0.unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn fills_to_capacity_minus_one() {
        let mut q = ToneQueue::new();
        for _ in 0..q.capacity() {
            q.push(Tone::new(1, 600)).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(q.push(Tone::new(1, 600)).unwrap_err().kind(), crate::error::ErrorKind::QueueFull);
    }

    #[test]
    fn low_water_fires_exactly_once_on_crossing() {
        let mut q = ToneQueue::new();
        q.register_low_water(Some(2)).unwrap();

        for _ in 0..5 {
            q.push(Tone::new(1, 600)).unwrap();
        }
        // length 5 -> 4 -> 3 -> 2 (crossing at this pop) -> 1 -> 0
        let mut crossings = 0;
        for _ in 0..5 {
            let (_, crossed) = q.pop();
            if crossed {
                crossings += 1;
            }
        }
        assert_eq!(crossings, 1);
    }

    #[test]
    fn register_low_water_rejects_out_of_range_level() {
        let mut q = ToneQueue::new();
        let err = q.register_low_water(Some(CAPACITY - 2)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn fifo_order() {
        let mut q = ToneQueue::new();
        q.push(Tone::new(1, 600)).unwrap();
        q.push(Tone::new(2, 700)).unwrap();
        q.push(Tone::new(3, 800)).unwrap();
        assert_eq!(q.pop().0.unwrap().duration_usec, 1);
        assert_eq!(q.pop().0.unwrap().duration_usec, 2);
        assert_eq!(q.pop().0.unwrap().duration_usec, 3);
    }
}
