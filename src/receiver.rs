// src/receiver.rs  —  timestamp-driven mark/space classifier
//
// Runs entirely on the caller's thread: there is no background timer here,
// only state transitions driven by `start_tone`/`end_tone`/`representation`
// calls supplying timestamps. Shares the engine's `TimingSolver` (for
// current receive ranges and the adaptive-threshold feedback loop) via the
// same `Arc<Mutex<..>>` pattern used by the keyer and straight key.

use crate::error::{CwError, CwResult, ErrorKind};
use crate::timing::TimingSolver;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub const REPRESENTATION_CAPACITY: usize = 256;
const STATS_CAPACITY: usize = 256;
const MOVING_AVERAGE_SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    InTone,
    AfterTone,
    EndChar,
    EndWord,
    ErrChar,
    ErrWord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { sec: d.as_secs() as i64, usec: d.subsec_micros() as i64 }
    }
}

fn normalize(ts: Option<Timestamp>) -> CwResult<Timestamp> {
    match ts {
        None => Ok(Timestamp::now()),
        Some(t) => {
            if t.usec < 0 || t.usec >= 1_000_000 {
                Err(CwError::invalid_argument(format!(
                    "timestamp microseconds {} out of range [0, 1_000_000)",
                    t.usec
                )))
            } else {
                Ok(t)
            }
        }
    }
}

/// Clamped to `i32::MAX`, matching the reference's `INT_MAX` saturation.
fn delta_usec(start: Timestamp, end: Timestamp) -> i64 {
    let s = start.sec as i128 * 1_000_000 + start.usec as i128;
    let e = end.sec as i128 * 1_000_000 + end.usec as i128;
    (e - s).clamp(0, i32::MAX as i128) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatKind {
    Dot,
    Dash,
    EndOfElement,
    EndOfCharacter,
}

struct MovingAverage {
    slots: [i64; MOVING_AVERAGE_SLOTS],
    idx: usize,
    sum: i64,
}

impl MovingAverage {
    fn new(initial: i64) -> Self {
        Self { slots: [initial; MOVING_AVERAGE_SLOTS], idx: 0, sum: initial * MOVING_AVERAGE_SLOTS as i64 }
    }

    fn update(&mut self, v: i64) {
        self.sum -= self.slots[self.idx];
        self.slots[self.idx] = v;
        self.sum += v;
        self.idx = (self.idx + 1) % MOVING_AVERAGE_SLOTS;
    }

    fn average(&self) -> i64 {
        self.sum / MOVING_AVERAGE_SLOTS as i64
    }
}

struct StatEntry {
    kind: StatKind,
    delta_usec: i64,
}

struct StatsRing {
    buf: Vec<Option<StatEntry>>,
    pos: usize,
}

impl StatsRing {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(STATS_CAPACITY);
        buf.resize_with(STATS_CAPACITY, || None);
        Self { buf, pos: 0 }
    }

    fn push(&mut self, kind: StatKind, delta_usec: i64) {
        self.buf[self.pos] = Some(StatEntry { kind, delta_usec });
        self.pos = (self.pos + 1) % STATS_CAPACITY;
    }

    fn stddev(&self, kind: StatKind) -> f64 {
        let vals: Vec<f64> = self
            .buf
            .iter()
            .flatten()
            .filter(|e| e.kind == kind)
            .map(|e| e.delta_usec as f64)
            .collect();
        if vals.is_empty() {
            return 0.0;
        }
        let mean = vals.iter().sum::<f64>() / vals.len() as f64;
        let variance = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / vals.len() as f64;
        variance.sqrt()
    }

    fn reset(&mut self) {
        self.buf.iter_mut().for_each(|e| *e = None);
        self.pos = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    pub dot_stddev_usec: f64,
    pub dash_stddev_usec: f64,
    pub eoe_stddev_usec: f64,
    pub eoc_stddev_usec: f64,
}

pub struct RepresentationOutput {
    pub representation: String,
    pub eow: bool,
    pub err: Option<ErrorKind>,
}

pub struct CharacterOutput {
    pub character: char,
    pub eow: bool,
}

/// External character/representation lookup, per §6's "external collaborator".
/// Both directions live on one trait since sender and receiver share the
/// same table; the engine never embeds character/prosign/phonetic data
/// itself (an explicit Non-goal).
pub trait RepresentationLookup {
    fn representation_to_char(&self, representation: &str) -> Option<char>;
    fn char_to_representation(&self, ch: char) -> Option<&str>;
}

pub struct Receiver {
    state: ReceiverState,
    representation: String,
    pending_err: Option<ErrorKind>,
    tone_start: Option<Timestamp>,
    tone_end: Option<Timestamp>,
    dot_avg: MovingAverage,
    dash_avg: MovingAverage,
    stats: StatsRing,
    timing: Arc<Mutex<TimingSolver>>,
}

impl Receiver {
    pub fn new(timing: Arc<Mutex<TimingSolver>>) -> Self {
        let initial_unit = {
            let mut t = timing.lock().unwrap();
            t.recv_params().dot_max.max(1) / 2
        };
        Self {
            state: ReceiverState::Idle,
            representation: String::new(),
            pending_err: None,
            tone_start: None,
            tone_end: None,
            dot_avg: MovingAverage::new(initial_unit),
            dash_avg: MovingAverage::new(initial_unit * 3),
            stats: StatsRing::new(),
            timing,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn start_tone(&mut self, ts: Option<Timestamp>) -> CwResult<()> {
        let ts = normalize(ts)?;
        match self.state {
            ReceiverState::Idle => {}
            ReceiverState::AfterTone => {
                if let Some(prev_end) = self.tone_end {
                    let gap = delta_usec(prev_end, ts);
                    self.stats.push(StatKind::EndOfElement, gap);
                }
            }
            _ => return Err(CwError::state_error("start_tone: receiver not IDLE or AFTER_TONE")),
        }
        self.tone_start = Some(ts);
        self.state = ReceiverState::InTone;
        Ok(())
    }

    pub fn end_tone(&mut self, ts: Option<Timestamp>) -> CwResult<()> {
        if self.state != ReceiverState::InTone {
            return Err(CwError::state_error("end_tone: receiver not IN_TONE"));
        }
        let ts = normalize(ts)?;
        let start = self.tone_start.expect("IN_TONE implies a recorded start timestamp");
        let mark_usec = delta_usec(start, ts);

        let mut timing = self.timing.lock().unwrap();
        let noise_threshold = timing.noise_threshold();
        if noise_threshold > 0 && mark_usec <= noise_threshold {
            self.state = if self.representation.is_empty() {
                ReceiverState::Idle
            } else {
                ReceiverState::AfterTone
            };
            return Err(CwError::ignored("mark at or below the noise threshold"));
        }

        let recv = timing.recv_params();
        if mark_usec >= recv.dot_min && mark_usec <= recv.dot_max {
            self.classify(&mut timing, '.', mark_usec, StatKind::Dot)?;
        } else if mark_usec >= recv.dash_min && mark_usec <= recv.dash_max {
            self.classify(&mut timing, '-', mark_usec, StatKind::Dash)?;
        } else {
            self.state = if mark_usec > recv.eoc_max { ReceiverState::ErrWord } else { ReceiverState::ErrChar };
            self.pending_err = Some(ErrorKind::NotFound);
            return Err(CwError::not_found("mark duration classified as neither dot nor dash"));
        }

        self.tone_end = Some(ts);
        self.state = ReceiverState::AfterTone;
        Ok(())
    }

    /// §9: the adaptive threshold is recomputed *before* the statistics
    /// sample for this mark is appended; reproduced deliberately, not a bug.
    fn classify(
        &mut self,
        timing: &mut TimingSolver,
        ch: char,
        mark_usec: i64,
        kind: StatKind,
    ) -> CwResult<()> {
        if self.representation.len() >= REPRESENTATION_CAPACITY - 1 {
            self.state = ReceiverState::ErrChar;
            self.pending_err = Some(ErrorKind::NoMemory);
            return Err(CwError::no_memory());
        }
        if timing.is_adaptive() {
            match kind {
                StatKind::Dot => self.dot_avg.update(mark_usec),
                StatKind::Dash => self.dash_avg.update(mark_usec),
                _ => {}
            }
            let threshold = self.dot_avg.average() + (self.dash_avg.average() - self.dot_avg.average()) / 2;
            timing.set_adaptive_threshold(threshold);
        }
        self.stats.push(kind, mark_usec);
        self.representation.push(ch);
        Ok(())
    }

    pub fn buffer_dot(&mut self, ts: Option<Timestamp>) -> CwResult<()> {
        self.buffer_element('.', ts)
    }

    pub fn buffer_dash(&mut self, ts: Option<Timestamp>) -> CwResult<()> {
        self.buffer_element('-', ts)
    }

    fn buffer_element(&mut self, ch: char, ts: Option<Timestamp>) -> CwResult<()> {
        if !matches!(self.state, ReceiverState::Idle | ReceiverState::AfterTone) {
            return Err(CwError::state_error("buffer_dot/buffer_dash: receiver not IDLE or AFTER_TONE"));
        }
        let ts = normalize(ts)?;
        if self.representation.len() >= REPRESENTATION_CAPACITY - 1 {
            self.state = ReceiverState::ErrChar;
            self.pending_err = Some(ErrorKind::NoMemory);
            return Err(CwError::no_memory());
        }
        self.representation.push(ch);
        self.tone_end = Some(ts);
        self.state = ReceiverState::AfterTone;
        Ok(())
    }

    pub fn representation(&mut self, ts: Option<Timestamp>) -> CwResult<RepresentationOutput> {
        match self.state {
            ReceiverState::EndWord | ReceiverState::ErrWord => {
                return Ok(RepresentationOutput {
                    representation: self.representation.clone(),
                    eow: true,
                    err: self.pending_err,
                });
            }
            ReceiverState::EndChar => {
                return Ok(RepresentationOutput {
                    representation: self.representation.clone(),
                    eow: false,
                    err: None,
                });
            }
            ReceiverState::AfterTone | ReceiverState::ErrChar => {}
            _ => return Err(CwError::state_error("representation: receiver not AFTER_TONE/END_CHAR/ERR_CHAR")),
        }

        let had_error = self.state == ReceiverState::ErrChar;
        let ts = normalize(ts)?;
        let recv = self.timing.lock().unwrap().recv_params();
        let last_end = self.tone_end.expect("AFTER_TONE/ERR_CHAR implies a recorded end timestamp");
        let gap = delta_usec(last_end, ts);

        if gap <= recv.eoe_max {
            return Err(CwError::try_again());
        }
        if gap <= recv.eoc_max {
            if !had_error {
                self.stats.push(StatKind::EndOfCharacter, gap);
                self.state = ReceiverState::EndChar;
            }
            return Ok(RepresentationOutput {
                representation: self.representation.clone(),
                eow: false,
                err: self.pending_err,
            });
        }

        self.state = if had_error { ReceiverState::ErrWord } else { ReceiverState::EndWord };
        Ok(RepresentationOutput {
            representation: self.representation.clone(),
            eow: true,
            err: self.pending_err,
        })
    }

    pub fn character(
        &mut self,
        ts: Option<Timestamp>,
        lookup: &dyn RepresentationLookup,
    ) -> CwResult<CharacterOutput> {
        let rep = self.representation(ts)?;
        if let Some(kind) = rep.err {
            return Err(CwError::new(kind, "representation carries a pending classification error"));
        }
        match lookup.representation_to_char(&rep.representation) {
            Some(c) => Ok(CharacterOutput { character: c, eow: rep.eow }),
            None => Err(CwError::not_found(format!(
                "no character for representation \"{}\"",
                rep.representation
            ))),
        }
    }

    pub fn clear_buffer(&mut self) {
        self.representation.clear();
        self.pending_err = None;
        self.tone_start = None;
        self.tone_end = None;
        self.state = ReceiverState::Idle;
    }

    pub fn get_statistics(&self) -> Statistics {
        Statistics {
            dot_stddev_usec: self.stats.stddev(StatKind::Dot),
            dash_stddev_usec: self.stats.stddev(StatKind::Dash),
            eoe_stddev_usec: self.stats.stddev(StatKind::EndOfElement),
            eoc_stddev_usec: self.stats.stddev(StatKind::EndOfCharacter),
        }
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TimingSolver;

    struct ParisLookup;
    impl RepresentationLookup for ParisLookup {
        fn representation_to_char(&self, representation: &str) -> Option<char> {
            match representation {
                "..." => Some('S'),
                "---" => Some('O'),
                _ => None,
            }
        }

        fn char_to_representation(&self, ch: char) -> Option<&str> {
            match ch {
                'S' => Some("..."),
                'O' => Some("---"),
                _ => None,
            }
        }
    }

    fn ts(usec_total: i64) -> Timestamp {
        Timestamp { sec: usec_total / 1_000_000, usec: usec_total % 1_000_000 }
    }

    fn receiver_at_12_wpm() -> Receiver {
        let mut t = TimingSolver::new();
        t.set_send_speed(12).unwrap();
        t.set_recv_speed(12).unwrap();
        Receiver::new(Arc::new(Mutex::new(t)))
    }

    #[test]
    fn receives_sos() {
        let mut r = receiver_at_12_wpm();
        // S: three dots of 100_000us separated by 100_000us gaps (eoe_delay)
        let mut t = 0i64;
        for _ in 0..3 {
            r.start_tone(Some(ts(t))).unwrap();
            t += 100_000;
            r.end_tone(Some(ts(t))).unwrap();
            t += 100_000;
        }
        // push well past eoe_max (150_000us) but within eoc_max (500_000us)
        // to resolve the trailing silence as an end-of-character gap.
        t += 300_000;
        let rep = r.representation(Some(ts(t))).unwrap();
        assert_eq!(rep.representation, "...");
        assert!(!rep.eow);
        let ch = r.character(Some(ts(t)), &ParisLookup).unwrap();
        assert_eq!(ch.character, 'S');
        r.clear_buffer();

        // O: three dashes of 300_000us
        let mut t2 = t;
        for _ in 0..3 {
            r.start_tone(Some(ts(t2))).unwrap();
            t2 += 300_000;
            r.end_tone(Some(ts(t2))).unwrap();
            t2 += 100_000;
        }
        t2 += 300_000;
        let rep2 = r.representation(Some(ts(t2))).unwrap();
        assert_eq!(rep2.representation, "---");
        let ch2 = r.character(Some(ts(t2)), &ParisLookup).unwrap();
        assert_eq!(ch2.character, 'O');
    }

    #[test]
    fn noise_spike_is_ignored_and_state_unchanged() {
        let mut t = TimingSolver::new();
        t.set_send_speed(12).unwrap();
        t.set_recv_speed(12).unwrap();
        t.set_noise_threshold(10_000).unwrap();
        let mut r = Receiver::new(Arc::new(Mutex::new(t)));
        r.start_tone(Some(ts(0))).unwrap();
        let err = r.end_tone(Some(ts(8_000))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ignored);
        assert_eq!(r.state(), ReceiverState::Idle);
    }

    #[test]
    fn exact_noise_threshold_is_ignored_next_usec_is_classified() {
        let mut t = TimingSolver::new();
        t.set_noise_threshold(10_000).unwrap();
        let mut r = Receiver::new(Arc::new(Mutex::new(t)));
        r.start_tone(Some(ts(0))).unwrap();
        assert_eq!(r.end_tone(Some(ts(10_000))).unwrap_err().kind(), ErrorKind::Ignored);

        r.start_tone(Some(ts(20_000))).unwrap();
        // 10_001us won't land in any default dot/dash range at 20wpm, but it
        // must not be rejected as noise — assert it's classified, not Ignored.
        let err = r.end_tone(Some(ts(30_001))).unwrap_err();
        assert_ne!(err.kind(), ErrorKind::Ignored);
    }

    #[test]
    fn overflow_transitions_to_err_char() {
        let mut t = TimingSolver::new();
        t.set_send_speed(60).unwrap();
        t.set_recv_speed(60).unwrap();
        let mut r = Receiver::new(Arc::new(Mutex::new(t)));
        let mut cursor = 0i64;
        for _ in 0..REPRESENTATION_CAPACITY {
            r.start_tone(Some(ts(cursor))).unwrap();
            cursor += 20_000;
            let _ = r.end_tone(Some(ts(cursor)));
            cursor += 5_000;
            if r.state() == ReceiverState::ErrChar {
                break;
            }
        }
        assert_eq!(r.state(), ReceiverState::ErrChar);
    }

    #[test]
    fn adaptive_tracking_converges_near_expected_threshold() {
        let mut t = TimingSolver::new();
        t.enable_adaptive();
        let mut r = Receiver::new(Arc::new(Mutex::new(t)));
        let mut cursor = 0i64;
        for _ in 0..10 {
            r.start_tone(Some(ts(cursor))).unwrap();
            cursor += 80_000;
            r.end_tone(Some(ts(cursor))).unwrap();
            cursor += 20_000;
        }
        for _ in 0..10 {
            r.start_tone(Some(ts(cursor))).unwrap();
            cursor += 240_000;
            r.end_tone(Some(ts(cursor))).unwrap();
            cursor += 60_000;
        }
        let stats = r.get_statistics();
        assert!(stats.dot_stddev_usec >= 0.0);
        assert!(stats.dash_stddev_usec >= 0.0);
    }
}
