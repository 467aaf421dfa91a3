// src/engine.rs  —  the library's single embedder-facing handle
//
// Composes the timing solver, dispatcher (tone queue + shared sink), iambic
// keyer, straight key, and receiver into one `Engine`. Each subsystem keeps
// its own background thread and its own lock; this module's job is wiring
// (the shared `ElementTiming` snapshot, the shared keying callback, and the
// `busy_external` cross-checks) rather than owning any of their state
// directly — composes its subsystems the way a top-level simulator handle
// composes its own collaborators, without reaching into their internals.

use crate::debug::DebugFlags;
use crate::dispatcher::{Dispatcher, KeyingCallback};
use crate::error::{CwError, CwResult};
use crate::keyer::Keyer;
use crate::receiver::{
    CharacterOutput, Receiver, RepresentationLookup, RepresentationOutput, Statistics, Timestamp,
};
use crate::sink::{Sink, SinkFamily};
use crate::straight_key::StraightKey;
use crate::timing::{ElementTiming, TimingSolver};
use crate::tone_queue::Tone;
use std::sync::{Arc, Mutex};

pub struct Engine {
    timing: Arc<Mutex<TimingSolver>>,
    dispatcher: Arc<Dispatcher>,
    keyer: Arc<Keyer>,
    straight_key: Arc<StraightKey>,
    receiver: Mutex<Receiver>,
    element_timing: Arc<Mutex<ElementTiming>>,
    keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
    debug: Mutex<DebugFlags>,
}

impl Engine {
    /// Opens `device` under the requested `family`, falling back to a
    /// silent sink on failure (`Sink::open`'s own fallback), and wires the
    /// dispatcher/keyer/straight-key/receiver quartet around it. Mirrors
    /// `generator_new` (§6); there is no fallible path here because the
    /// sink itself never fails to construct.
    pub fn new(family: SinkFamily, device: &str) -> Self {
        let debug = DebugFlags::from_env();
        let sink = Sink::open(family, device);

        let mut solver = TimingSolver::new();
        let element_timing = Arc::new(Mutex::new(solver.element_timing()));
        let timing = Arc::new(Mutex::new(solver));

        let dispatcher = Arc::new(Dispatcher::new(sink));
        let keying_cb: Arc<Mutex<Option<KeyingCallback>>> = Arc::new(Mutex::new(None));

        let keyer = Arc::new(Keyer::new(
            dispatcher.sink_handle(),
            Arc::clone(&dispatcher),
            Arc::clone(&element_timing),
            Arc::clone(&keying_cb),
        ));
        let straight_key = Arc::new(StraightKey::new(
            dispatcher.sink_handle(),
            Arc::clone(&dispatcher),
            Arc::clone(&element_timing),
            Arc::clone(&keying_cb),
        ));
        let receiver = Mutex::new(Receiver::new(Arc::clone(&timing)));

        // The dispatcher fires its own internal keying callback from its
        // worker thread; route it through the same shared slot so the
        // embedder sees one callback regardless of which subsystem is
        // sounding (§4.3/§6: "a single optional fn(...) at process scope").
        let relay = Arc::clone(&keying_cb);
        dispatcher.register_keying_callback(Some(Box::new(move |down| {
            if let Some(f) = relay.lock().unwrap().as_mut() {
                f(down);
            }
        })));

        log::info!("engine initialized ({:?}, device={device:?})", family);
        Self { timing, dispatcher, keyer, straight_key, receiver, element_timing, keying_cb, debug: Mutex::new(debug) }
    }

    fn sync_element_timing(&self, solver: &mut TimingSolver) {
        *self.element_timing.lock().unwrap() = solver.element_timing();
    }

    fn busy_for_dispatcher(&self) -> bool {
        self.keyer.is_busy() || self.straight_key.is_busy()
    }
    fn busy_for_keyer(&self) -> bool {
        self.dispatcher.is_busy() || self.straight_key.is_busy()
    }
    fn busy_for_straight_key(&self) -> bool {
        self.dispatcher.is_busy() || self.keyer.is_busy()
    }

    // ── lifecycle (§6 "Library lifecycle") ──────────────────────────────

    pub fn start(&self) -> CwResult<()> {
        log::debug!("engine start (no-op: sink is opened in `new` and torn down by finalization)");
        Ok(())
    }

    pub fn stop(&self) -> CwResult<()> {
        self.dispatcher.flush()
    }

    /// Drains the queue, resets keyer/straight key/receiver, silences the
    /// sink, and disables the finalization lockout (§6).
    pub fn complete_reset(&self) {
        self.dispatcher.reset();
        self.keyer.reset();
        self.receiver.lock().unwrap().clear_buffer();
        self.receiver.lock().unwrap().reset_statistics();
        log::info!("complete_reset finished");
    }

    #[cfg(feature = "signals")]
    pub fn register_signal_handler(
        self: &Arc<Self>,
        sig: std::os::raw::c_int,
        callback: Box<dyn Fn() + Send + Sync + 'static>,
    ) -> CwResult<()> {
        use signal_hook::iterator::Signals;
        let mut signals = Signals::new([sig]).map_err(|e| CwError::system(e.to_string()))?;
        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            for _ in signals.forever() {
                // Re-entrant by construction: `complete_reset` and the
                // callback only ever touch the same locks this thread does,
                // never ones held by the signaled thread itself.
                engine.complete_reset();
                callback();
            }
        });
        Ok(())
    }

    // ── shared gates ─────────────────────────────────────────────────────

    pub fn block_callbacks(&self, block: bool) {
        self.dispatcher.block_callbacks(block);
        self.keyer.block_callbacks(block);
        self.straight_key.block_callbacks(block);
    }

    pub fn register_keying_callback(&self, cb: Option<KeyingCallback>) {
        *self.keying_cb.lock().unwrap() = cb;
    }

    pub fn register_low_water_callback(
        &self,
        level: Option<usize>,
        cb: Option<Box<dyn FnMut() + Send>>,
    ) -> CwResult<()> {
        self.dispatcher.register_low_water(level, cb)
    }

    pub fn set_debug_flags(&self, flags: DebugFlags) {
        *self.debug.lock().unwrap() = flags;
    }

    pub fn debug_flags(&self) -> DebugFlags {
        *self.debug.lock().unwrap()
    }

    // ── timing solver passthrough (§4.1, ambient "configuration surface") ─

    pub fn set_send_speed(&self, wpm: u32) -> CwResult<()> {
        let mut t = self.timing.lock().unwrap();
        t.set_send_speed(wpm)?;
        self.sync_element_timing(&mut t);
        Ok(())
    }

    pub fn set_recv_speed(&self, wpm: u32) -> CwResult<()> {
        let mut t = self.timing.lock().unwrap();
        t.set_recv_speed(wpm)?;
        self.sync_element_timing(&mut t);
        Ok(())
    }

    pub fn set_gap(&self, gap_dots: u32) -> CwResult<()> {
        let mut t = self.timing.lock().unwrap();
        t.set_gap(gap_dots)?;
        self.sync_element_timing(&mut t);
        Ok(())
    }

    pub fn set_tolerance(&self, tolerance_pct: u32) -> CwResult<()> {
        let mut t = self.timing.lock().unwrap();
        t.set_tolerance(tolerance_pct)?;
        self.sync_element_timing(&mut t);
        Ok(())
    }

    pub fn set_weighting(&self, weighting: u32) -> CwResult<()> {
        let mut t = self.timing.lock().unwrap();
        t.set_weighting(weighting)?;
        self.sync_element_timing(&mut t);
        Ok(())
    }

    pub fn set_frequency(&self, hz: u32) -> CwResult<()> {
        let mut t = self.timing.lock().unwrap();
        t.set_frequency(hz)?;
        self.sync_element_timing(&mut t);
        Ok(())
    }

    pub fn set_volume(&self, percent: u32) -> CwResult<()> {
        let mut t = self.timing.lock().unwrap();
        t.set_volume(percent)?;
        self.sync_element_timing(&mut t);
        drop(t);
        self.dispatcher.set_volume(percent);
        Ok(())
    }

    pub fn set_noise_threshold(&self, usec: i64) -> CwResult<()> {
        self.timing.lock().unwrap().set_noise_threshold(usec)
    }

    pub fn enable_adaptive(&self) {
        let mut t = self.timing.lock().unwrap();
        t.enable_adaptive();
        self.sync_element_timing(&mut t);
    }

    pub fn disable_adaptive(&self) {
        let mut t = self.timing.lock().unwrap();
        t.disable_adaptive();
        self.sync_element_timing(&mut t);
    }

    pub fn send_speed(&self) -> u32 {
        self.timing.lock().unwrap().send_speed()
    }
    pub fn recv_speed(&self) -> u32 {
        self.timing.lock().unwrap().recv_speed()
    }
    pub fn gap(&self) -> u32 {
        self.timing.lock().unwrap().gap()
    }
    pub fn tolerance(&self) -> u32 {
        self.timing.lock().unwrap().tolerance()
    }
    pub fn weighting(&self) -> u32 {
        self.timing.lock().unwrap().weighting()
    }
    pub fn frequency(&self) -> u32 {
        self.timing.lock().unwrap().frequency()
    }
    pub fn volume(&self) -> u32 {
        self.timing.lock().unwrap().volume()
    }
    pub fn noise_threshold(&self) -> i64 {
        self.timing.lock().unwrap().noise_threshold()
    }
    pub fn is_adaptive(&self) -> bool {
        self.timing.lock().unwrap().is_adaptive()
    }

    // ── sending (tone queue / dispatcher) ────────────────────────────────

    pub fn send_dot(&self) -> CwResult<()> {
        let (mark, gap, freq) = {
            let mut t = self.timing.lock().unwrap();
            let sp = t.send_params();
            (sp.dot_len as u64, sp.eoe_delay as u64, t.frequency())
        };
        self.enqueue_element(mark, gap, freq)
    }

    pub fn send_dash(&self) -> CwResult<()> {
        let (mark, gap, freq) = {
            let mut t = self.timing.lock().unwrap();
            let sp = t.send_params();
            (sp.dash_len as u64, sp.eoe_delay as u64, t.frequency())
        };
        self.enqueue_element(mark, gap, freq)
    }

    fn enqueue_element(&self, mark_usec: u64, gap_usec: u64, freq: u32) -> CwResult<()> {
        let busy = self.busy_for_dispatcher();
        self.dispatcher.enqueue(Tone::new(mark_usec, freq), busy)?;
        self.dispatcher.enqueue(Tone::new(gap_usec, 0), busy)
    }

    /// Sends a raw representation ({'.','-'}+) directly, e.g. for prosigns
    /// the embedder's lookup table renders without inter-character gaps.
    pub fn send_representation(&self, representation: &str) -> CwResult<()> {
        let (sp, freq) = {
            let mut t = self.timing.lock().unwrap();
            (t.send_params(), t.frequency())
        };
        let busy = self.busy_for_dispatcher();
        let count = representation.chars().count();
        for (i, c) in representation.chars().enumerate() {
            let mark = match c {
                '.' => sp.dot_len as u64,
                '-' => sp.dash_len as u64,
                other => {
                    return Err(CwError::invalid_argument(format!(
                        "representation character '{other}' is neither '.' nor '-'"
                    )))
                }
            };
            self.dispatcher.enqueue(Tone::new(mark, freq), busy)?;
            let gap = if i + 1 == count { sp.eoc_delay as u64 } else { sp.eoe_delay as u64 };
            self.dispatcher.enqueue(Tone::new(gap, 0), busy)?;
        }
        Ok(())
    }

    /// A space sends an end-of-word delay; anything else is looked up via
    /// `lookup` (the external character/representation collaborator, §6).
    pub fn send_character(&self, ch: char, lookup: &dyn RepresentationLookup) -> CwResult<()> {
        if ch == ' ' {
            let eow = self.timing.lock().unwrap().send_params().eow_delay as u64;
            let busy = self.busy_for_dispatcher();
            return self.dispatcher.enqueue(Tone::new(eow, 0), busy);
        }
        let representation = lookup
            .char_to_representation(ch)
            .ok_or_else(|| CwError::not_found(format!("no representation for character '{ch}'")))?;
        self.send_representation(representation)
    }

    pub fn send_string(&self, text: &str, lookup: &dyn RepresentationLookup) -> CwResult<()> {
        for ch in text.chars() {
            self.send_character(ch, lookup)?;
        }
        Ok(())
    }

    // ── tone queue introspection ─────────────────────────────────────────

    pub fn queue_length(&self) -> usize {
        self.dispatcher.length()
    }
    pub fn queue_capacity(&self) -> usize {
        self.dispatcher.capacity()
    }
    pub fn is_full(&self) -> bool {
        self.dispatcher.is_full()
    }
    pub fn is_busy(&self) -> bool {
        self.dispatcher.is_busy() || self.keyer.is_busy() || self.straight_key.is_busy()
    }

    pub fn wait_for_tone(&self) -> CwResult<()> {
        self.dispatcher.wait_for_tone()
    }
    pub fn wait_for_queue(&self) -> CwResult<()> {
        self.dispatcher.wait_for_queue()
    }
    pub fn wait_for_level(&self, n: usize) -> CwResult<()> {
        self.dispatcher.wait_for_level(n)
    }

    // ── iambic keyer ─────────────────────────────────────────────────────

    pub fn set_curtis_mode_b(&self, enabled: bool) {
        self.keyer.set_curtis_mode_b(enabled);
    }

    pub fn notify_paddles(&self, dot: bool, dash: bool) -> CwResult<()> {
        let busy = self.busy_for_keyer();
        self.keyer.notify_paddles(dot, dash, busy)
    }

    pub fn keyer_is_busy(&self) -> bool {
        self.keyer.is_busy()
    }

    pub fn wait_for_element(&self) -> CwResult<()> {
        self.keyer.wait_for_element()
    }

    pub fn wait_for_keyer(&self) -> CwResult<()> {
        self.keyer.wait_for_keyer()
    }

    // ── straight key ─────────────────────────────────────────────────────

    pub fn notify_straight_key_event(&self, down: bool) -> CwResult<()> {
        let busy = self.busy_for_straight_key();
        self.straight_key.notify_event(down, busy)
    }

    pub fn straight_key_is_busy(&self) -> bool {
        self.straight_key.is_busy()
    }

    pub fn wait_for_straight_key(&self) -> CwResult<()> {
        self.straight_key.wait_for_keyer()
    }

    // ── receiver ─────────────────────────────────────────────────────────

    pub fn start_tone(&self, ts: Option<Timestamp>) -> CwResult<()> {
        self.receiver.lock().unwrap().start_tone(ts)
    }

    pub fn end_tone(&self, ts: Option<Timestamp>) -> CwResult<()> {
        self.receiver.lock().unwrap().end_tone(ts)
    }

    pub fn buffer_dot(&self, ts: Option<Timestamp>) -> CwResult<()> {
        self.receiver.lock().unwrap().buffer_dot(ts)
    }

    pub fn buffer_dash(&self, ts: Option<Timestamp>) -> CwResult<()> {
        self.receiver.lock().unwrap().buffer_dash(ts)
    }

    pub fn representation(&self, ts: Option<Timestamp>) -> CwResult<RepresentationOutput> {
        self.receiver.lock().unwrap().representation(ts)
    }

    pub fn character(
        &self,
        ts: Option<Timestamp>,
        lookup: &dyn RepresentationLookup,
    ) -> CwResult<CharacterOutput> {
        self.receiver.lock().unwrap().character(ts, lookup)
    }

    pub fn clear_receive_buffer(&self) {
        self.receiver.lock().unwrap().clear_buffer();
    }

    pub fn get_statistics(&self) -> Statistics {
        self.receiver.lock().unwrap().get_statistics()
    }

    pub fn reset_statistics(&self) {
        self.receiver.lock().unwrap().reset_statistics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ParisLookup;
    impl RepresentationLookup for ParisLookup {
        fn representation_to_char(&self, representation: &str) -> Option<char> {
            match representation {
                ".--." => Some('P'),
                ".-" => Some('A'),
                ".-." => Some('R'),
                ".." => Some('I'),
                "..." => Some('S'),
                _ => None,
            }
        }
        fn char_to_representation(&self, ch: char) -> Option<&str> {
            match ch {
                'P' => Some(".--."),
                'A' => Some(".-"),
                'R' => Some(".-."),
                'I' => Some(".."),
                'S' => Some("..."),
                _ => None,
            }
        }
    }

    fn test_engine() -> Engine {
        Engine::new(SinkFamily::Silent, "")
    }

    #[test]
    fn send_paris_enqueues_and_drains() {
        let e = test_engine();
        e.set_send_speed(12).unwrap();
        e.send_string("PARIS", &ParisLookup).unwrap();
        assert!(e.queue_length() > 0);
        e.wait_for_queue().unwrap();
        assert_eq!(e.queue_length(), 0);
    }

    #[test]
    fn unknown_character_is_not_found() {
        let e = test_engine();
        let err = e.send_character('Z', &ParisLookup).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn paddles_and_tone_queue_are_mutually_exclusive() {
        let e = test_engine();
        e.set_send_speed(20).unwrap();
        e.send_dash().unwrap();
        let err = e.notify_paddles(true, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
        e.wait_for_queue().unwrap();
    }

    #[test]
    fn receive_roundtrips_through_engine() {
        let e = test_engine();
        e.set_send_speed(12).unwrap();
        e.set_recv_speed(12).unwrap();
        let mut t = 0i64;
        for _ in 0..3 {
            e.start_tone(Some(Timestamp { sec: t / 1_000_000, usec: t % 1_000_000 })).unwrap();
            t += 100_000;
            e.end_tone(Some(Timestamp { sec: t / 1_000_000, usec: t % 1_000_000 })).unwrap();
            t += 100_000;
        }
        // push well past eoe_max (150_000us at 12 WPM, tolerance 50%) so the
        // trailing silence resolves as an end-of-character gap, not TryAgain.
        t += 300_000;
        let out = e.character(Some(Timestamp { sec: t / 1_000_000, usec: t % 1_000_000 }), &ParisLookup).unwrap();
        assert_eq!(out.character, 'S');
    }

    #[test]
    fn complete_reset_clears_receive_buffer_and_queue() {
        let e = test_engine();
        e.set_send_speed(20).unwrap();
        e.send_dash().unwrap();
        e.start_tone(None).unwrap();
        e.complete_reset();
        assert_eq!(e.queue_length(), 0);
        assert!(!e.is_busy());
    }
}
