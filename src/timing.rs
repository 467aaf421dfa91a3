// src/timing.rs  —  WPM/weighting/gap/tolerance → microsecond durations
//
// Mirrors the PARIS-calibration math of the reference timing solver: every
// setter raises a dirty bit, and `solve()` is idempotent and lazy — it is
// invoked at the start of any operation that needs current timings rather
// than from a dedicated init call, so first-use is always correct.

use crate::error::{CwError, CwResult};

pub const SPEED_MIN: u32 = 4;
pub const SPEED_MAX: u32 = 60;
pub const FREQ_MIN: u32 = 0;
pub const FREQ_MAX: u32 = 10_000;
pub const VOLUME_MIN: u32 = 0;
pub const VOLUME_MAX: u32 = 100;
pub const GAP_MIN: u32 = 0;
pub const GAP_MAX: u32 = 60;
pub const WEIGHTING_MIN: u32 = 20;
pub const WEIGHTING_MAX: u32 = 80;
pub const TOLERANCE_MIN: u32 = 0;
pub const TOLERANCE_MAX: u32 = 90;

/// Derived send-side durations, all in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendParams {
    pub dot_len: i64,
    pub dash_len: i64,
    pub eoe_delay: i64,
    pub eoc_delay: i64,
    pub eow_delay: i64,
}

/// Snapshot of the handful of send parameters the iambic keyer and straight
/// key need to sound an element directly, bypassing the tone queue. Kept
/// tiny and `Copy` so it can be shared via `Arc<Mutex<..>>` without the
/// keyer/straight-key threads touching the rest of `TimingSolver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementTiming {
    pub dot_len: i64,
    pub dash_len: i64,
    pub eoe_delay: i64,
    pub frequency_hz: u32,
    pub volume_percent: u32,
}

/// Derived receive-side ranges, all in microseconds. `dash_max` of `i64::MAX`
/// denotes an open-ended upper bound (adaptive mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvParams {
    pub dot_min: i64,
    pub dot_max: i64,
    pub dash_min: i64,
    pub dash_max: i64,
    pub eoe_max: i64,
    pub eoc_max: i64,
    pub adaptive_threshold: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct TimingSolver {
    wpm_send: u32,
    wpm_recv: u32,
    weighting: u32,
    gap_dots: u32,
    tolerance_pct: u32,
    frequency_hz: u32,
    volume_percent: u32,
    noise_threshold_usec: i64,
    adaptive: bool,
    dirty: bool,
    send: SendParams,
    recv: RecvParams,
}

impl Default for TimingSolver {
    fn default() -> Self {
        let mut s = Self {
            wpm_send: 20,
            wpm_recv: 20,
            weighting: 50,
            gap_dots: 0,
            tolerance_pct: 50,
            frequency_hz: 800,
            volume_percent: 70,
            noise_threshold_usec: 0,
            adaptive: false,
            dirty: true,
            send: SendParams::default(),
            recv: RecvParams::default(),
        };
        s.solve();
        s
    }
}

impl TimingSolver {
    pub fn new() -> Self {
        Self::default()
    }

    // ── setters ──────────────────────────────────────────────────────────

    pub fn set_send_speed(&mut self, wpm: u32) -> CwResult<()> {
        check_range(wpm, SPEED_MIN, SPEED_MAX, "send speed")?;
        self.wpm_send = wpm;
        self.dirty = true;
        Ok(())
    }

    pub fn set_recv_speed(&mut self, wpm: u32) -> CwResult<()> {
        if self.adaptive {
            return Err(CwError::not_permitted(
                "cannot set receive speed while adaptive receive is enabled",
            ));
        }
        check_range(wpm, SPEED_MIN, SPEED_MAX, "receive speed")?;
        self.wpm_recv = wpm;
        self.dirty = true;
        Ok(())
    }

    pub fn set_gap(&mut self, gap_dots: u32) -> CwResult<()> {
        check_range(gap_dots, GAP_MIN, GAP_MAX, "gap")?;
        self.gap_dots = gap_dots;
        self.dirty = true;
        Ok(())
    }

    pub fn set_tolerance(&mut self, tolerance_pct: u32) -> CwResult<()> {
        check_range(tolerance_pct, TOLERANCE_MIN, TOLERANCE_MAX, "tolerance")?;
        self.tolerance_pct = tolerance_pct;
        self.dirty = true;
        Ok(())
    }

    pub fn set_weighting(&mut self, weighting: u32) -> CwResult<()> {
        check_range(weighting, WEIGHTING_MIN, WEIGHTING_MAX, "weighting")?;
        self.weighting = weighting;
        self.dirty = true;
        Ok(())
    }

    pub fn set_frequency(&mut self, hz: u32) -> CwResult<()> {
        check_range(hz, FREQ_MIN, FREQ_MAX, "frequency")?;
        self.frequency_hz = hz;
        self.dirty = true;
        Ok(())
    }

    pub fn set_volume(&mut self, percent: u32) -> CwResult<()> {
        check_range(percent, VOLUME_MIN, VOLUME_MAX, "volume")?;
        self.volume_percent = percent;
        self.dirty = true;
        Ok(())
    }

    pub fn set_noise_threshold(&mut self, usec: i64) -> CwResult<()> {
        if usec < 0 {
            return Err(CwError::invalid_argument("noise threshold must be >= 0"));
        }
        self.noise_threshold_usec = usec;
        self.dirty = true;
        Ok(())
    }

    /// Adaptive clamp path (§4.1): dropping adaptive mode to re-solve at a
    /// fixed speed, then re-enabling it, is the same double-sync used on
    /// every adaptive toggle (§4.8) — reproduced here for the explicit
    /// enable/disable entry points too.
    pub fn enable_adaptive(&mut self) {
        if self.adaptive {
            return;
        }
        self.adaptive = false;
        self.dirty = true;
        self.solve();
        self.adaptive = true;
        self.dirty = true;
        self.solve();
    }

    pub fn disable_adaptive(&mut self) {
        if !self.adaptive {
            return;
        }
        self.adaptive = false;
        self.dirty = true;
        self.solve();
    }

    // ── getters ──────────────────────────────────────────────────────────

    pub fn send_speed(&self) -> u32 {
        self.wpm_send
    }
    pub fn recv_speed(&self) -> u32 {
        self.wpm_recv
    }
    pub fn gap(&self) -> u32 {
        self.gap_dots
    }
    pub fn tolerance(&self) -> u32 {
        self.tolerance_pct
    }
    pub fn weighting(&self) -> u32 {
        self.weighting
    }
    pub fn frequency(&self) -> u32 {
        self.frequency_hz
    }
    pub fn volume(&self) -> u32 {
        self.volume_percent
    }
    pub fn noise_threshold(&self) -> i64 {
        self.noise_threshold_usec
    }
    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    /// Directly install an adaptive threshold computed by the receiver
    /// (§4.8's moving-average update) and re-solve.
    pub fn set_adaptive_threshold(&mut self, threshold_usec: i64) {
        self.recv.adaptive_threshold = threshold_usec;
        // wpm_recv = 1_200_000 / (threshold/2), kept in lockstep (§3).
        let half = (threshold_usec / 2).max(1);
        let mut wpm = (1_200_000 / half) as u32;
        let clamp_needed = wpm < SPEED_MIN || wpm > SPEED_MAX;
        wpm = wpm.clamp(SPEED_MIN, SPEED_MAX);
        self.wpm_recv = wpm;
        if clamp_needed {
            // §4.1: clamp path — drop adaptive, re-solve fixed, re-enable, re-solve.
            self.adaptive = false;
            self.dirty = true;
            self.solve();
            self.adaptive = true;
        }
        self.dirty = true;
        self.solve();
    }

    // ── solver ───────────────────────────────────────────────────────────

    /// Idempotent; safe to call unconditionally before any operation needs
    /// current timings. Only recomputes when the dirty bit is set.
    pub fn solve(&mut self) -> (SendParams, RecvParams) {
        if self.dirty {
            self.send = solve_send(self.wpm_send, self.weighting, self.gap_dots);
            self.recv = solve_recv(
                self.wpm_recv,
                self.tolerance_pct,
                self.adaptive,
                self.recv.adaptive_threshold,
            );
            self.dirty = false;
        }
        (self.send, self.recv)
    }

    pub fn send_params(&mut self) -> SendParams {
        self.solve().0
    }

    pub fn recv_params(&mut self) -> RecvParams {
        self.solve().1
    }

    pub fn element_timing(&mut self) -> ElementTiming {
        let send = self.send_params();
        ElementTiming {
            dot_len: send.dot_len,
            dash_len: send.dash_len,
            eoe_delay: send.eoe_delay,
            frequency_hz: self.frequency_hz,
            volume_percent: self.volume_percent,
        }
    }
}

fn check_range(v: u32, min: u32, max: u32, name: &str) -> CwResult<()> {
    if v < min || v > max {
        Err(CwError::invalid_argument(format!(
            "{name} {v} out of range [{min}, {max}]"
        )))
    } else {
        Ok(())
    }
}

/// §3 send-parameter formulas, integer microsecond arithmetic throughout
/// (matches the PARIS calibration exactly; no floating point in the hot path).
fn solve_send(wpm: u32, weighting: u32, gap_dots: u32) -> SendParams {
    let wpm = wpm as i64;
    let weighting = weighting as i64;
    let gap_dots = gap_dots as i64;

    let unit = 1_200_000 / wpm;
    let weight_adj = 2 * (weighting - 50) * unit / 100;
    let dot_len = unit + weight_adj;
    let dash_len = 3 * dot_len;
    let eoe_delay = unit - (28 * weight_adj) / 22;
    let eoc_delay_base = 3 * unit - eoe_delay;
    let eow_delay_base = 7 * unit - eoc_delay_base;

    let gap_additional = gap_dots * unit;
    let gap_adjustment = (7 * gap_additional) / 3;

    // Open question, decided here (see DESIGN.md): `eow_delay_base` is
    // `7*unit - eoc_delay_base`, i.e. it is the word gap's *remainder* over
    // the character gap it is built from. `eoc_delay` already widens by
    // `gap_additional`; leaving that out of `eow_delay` would make the word
    // gap fall behind the very character gap it is defined relative to as
    // soon as `gap_dots != 0`. `eow_delay` carries both: `gap_additional`
    // to stay at least as wide as `eoc_delay`, plus `gap_adjustment` (the
    // 7:3 scaling of the word:character unit ratio) as the word-specific
    // extra.
    SendParams {
        dot_len,
        dash_len,
        eoe_delay,
        eoc_delay: eoc_delay_base + gap_additional,
        eow_delay: eow_delay_base + gap_additional + gap_adjustment,
    }
}

/// §3 receive-parameter formulas.
fn solve_recv(wpm: u32, tolerance_pct: u32, adaptive: bool, current_threshold: i64) -> RecvParams {
    let wpm = wpm as i64;
    let unit_r = 1_200_000 / wpm;
    let dot_len_r = unit_r;
    let dash_len_r = 3 * unit_r;

    if adaptive {
        let adaptive_threshold = if current_threshold > 0 {
            current_threshold
        } else {
            2 * unit_r
        };
        RecvParams {
            dot_min: 0,
            dot_max: 2 * dot_len_r,
            dash_min: 2 * dot_len_r + 1,
            dash_max: i64::MAX,
            eoe_max: 2 * dot_len_r,
            eoc_max: 5 * dot_len_r,
            adaptive_threshold,
        }
    } else {
        let tolerance = dot_len_r * tolerance_pct as i64 / 100;
        RecvParams {
            dot_min: (dot_len_r - tolerance).max(0),
            dot_max: dot_len_r + tolerance,
            dash_min: (dash_len_r - tolerance).max(0),
            dash_max: dash_len_r + tolerance,
            eoe_max: dot_len_r + tolerance,
            eoc_max: 5 * dot_len_r,
            adaptive_threshold: 2 * unit_r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paris_dash_is_triple_dot() {
        for wpm in SPEED_MIN..=SPEED_MAX {
            for weighting in [20u32, 50, 80] {
                let send = solve_send(wpm, weighting, 0);
                assert_eq!(send.dash_len, 3 * send.dot_len);
            }
        }
    }

    #[test]
    fn twelve_wpm_paris_elements() {
        let send = solve_send(12, 50, 0);
        assert_eq!(send.dot_len, 100_000);
        assert_eq!(send.dash_len, 300_000);
        assert_eq!(send.eoe_delay, 100_000);
        assert_eq!(send.eoc_delay, 200_000);
        assert_eq!(send.eow_delay, 400_000);
    }

    #[test]
    fn farnsworth_gap_widens_word_spacing_at_least_as_much_as_character_spacing() {
        let base = solve_send(12, 50, 0);
        let gapped = solve_send(12, 50, 3);
        let eoc_growth = gapped.eoc_delay - base.eoc_delay;
        let eow_growth = gapped.eow_delay - base.eow_delay;
        assert!(eoc_growth > 0);
        assert!(
            eow_growth >= eoc_growth,
            "word gap grew by {eow_growth}us, less than the character gap's {eoc_growth}us"
        );
    }

    #[test]
    fn recv_speed_rejected_under_adaptive() {
        let mut t = TimingSolver::new();
        t.enable_adaptive();
        let before = t.recv_speed();
        let err = t.set_recv_speed(30).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotPermitted);
        assert_eq!(t.recv_speed(), before);
    }

    #[test]
    fn setter_idempotence() {
        let mut a = TimingSolver::new();
        a.set_send_speed(25).unwrap();
        let mut b = TimingSolver::new();
        b.set_send_speed(25).unwrap();
        b.set_send_speed(25).unwrap();
        assert_eq!(a.send_params(), b.send_params());
    }

    #[test]
    fn out_of_range_is_invalid_argument() {
        let mut t = TimingSolver::new();
        let err = t.set_send_speed(1000).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn adaptive_clamp_keeps_adaptive_enabled() {
        let mut t = TimingSolver::new();
        t.enable_adaptive();
        // A large enough threshold drives the raw wpm_recv below SPEED_MIN;
        // the clamp path must leave it pinned at SPEED_MIN with adaptive
        // mode still enabled (§8 boundary behavior).
        t.set_adaptive_threshold(700_000);
        assert!(t.is_adaptive());
        assert_eq!(t.recv_speed(), SPEED_MIN);
    }

    #[test]
    fn adaptive_clamp_upper_bound() {
        let mut t = TimingSolver::new();
        t.enable_adaptive();
        t.set_adaptive_threshold(10);
        assert!(t.is_adaptive());
        assert_eq!(t.recv_speed(), SPEED_MAX);
    }
}
