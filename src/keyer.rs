// src/keyer.rs  —  two-paddle iambic keyer (Curtis Mode A / Mode B)
//
// Sounds the shared sink directly under its own tick loop instead of going
// through the tone queue — the dispatcher and the keyer are mutually
// exclusive (each is `Busy` while the other is active) rather than layered.
// Finalization piggybacks on the dispatcher's existing 10-second/1-second
// countdown via `cancel_finalization`/`schedule_finalization` so there is
// only one sink-teardown timer in the process, not three.

use crate::dispatcher::{Dispatcher, KeyingCallback};
use crate::error::{CwError, CwResult};
use crate::generator::ToneState;
use crate::sink::Sink;
use crate::timing::ElementTiming;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Dot,
    Dash,
}

impl Element {
    fn opposite(self) -> Element {
        match self {
            Element::Dot => Element::Dash,
            Element::Dash => Element::Dot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyerState {
    Idle,
    In(Element, Mode),
    After(Element, Mode),
}

struct Inner {
    state: KeyerState,
    dot_paddle: bool,
    dash_paddle: bool,
    dot_latch: bool,
    dash_latch: bool,
    curtis_b_latch: bool,
    last_element: Option<Element>,
    last_key_down: bool,
    state_gen: u64,
}

pub struct Keyer {
    inner: Arc<Mutex<Inner>>,
    cv: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
    masked: Arc<AtomicBool>,
    curtis_mode_b: Arc<AtomicBool>,
    sink: Arc<Mutex<Sink>>,
    dispatcher: Arc<Dispatcher>,
    timing: Arc<Mutex<ElementTiming>>,
    keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
    worker: Option<JoinHandle<()>>,
}

impl Keyer {
    pub fn new(
        sink: Arc<Mutex<Sink>>,
        dispatcher: Arc<Dispatcher>,
        timing: Arc<Mutex<ElementTiming>>,
        keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            state: KeyerState::Idle,
            dot_paddle: false,
            dash_paddle: false,
            dot_latch: false,
            dash_latch: false,
            curtis_b_latch: false,
            last_element: None,
            last_key_down: false,
            state_gen: 0,
        }));
        let cv = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let inner = Arc::clone(&inner);
            let cv = Arc::clone(&cv);
            let shutdown = Arc::clone(&shutdown);
            let sink = Arc::clone(&sink);
            let dispatcher = Arc::clone(&dispatcher);
            let timing = Arc::clone(&timing);
            let keying_cb = Arc::clone(&keying_cb);
            std::thread::spawn(move || Self::run(inner, cv, shutdown, sink, dispatcher, timing, keying_cb))
        };

        Self {
            inner,
            cv,
            shutdown,
            masked: Arc::new(AtomicBool::new(false)),
            curtis_mode_b: Arc::new(AtomicBool::new(false)),
            sink,
            dispatcher,
            timing,
            keying_cb,
            worker: Some(worker),
        }
    }

    fn run(
        inner: Arc<Mutex<Inner>>,
        cv: Arc<Condvar>,
        shutdown: Arc<AtomicBool>,
        sink: Arc<Mutex<Sink>>,
        dispatcher: Arc<Dispatcher>,
        timing: Arc<Mutex<ElementTiming>>,
        keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
    ) {
        loop {
            let mut guard = inner.lock().unwrap();
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match guard.state {
                KeyerState::Idle | KeyerState::After(..) => {
                    let _g = cv.wait(guard).unwrap();
                }
                KeyerState::In(elem, mode) => {
                    let edge = Self::start_sounding(&mut guard, &sink, &timing);
                    let dur = {
                        let t = *timing.lock().unwrap();
                        match elem {
                            Element::Dot => t.dot_len,
                            Element::Dash => t.dash_len,
                        }
                    };
                    drop(guard);
                    cv.notify_all();
                    // Invoked only once the guard above is gone: a callback
                    // is allowed to call straight back into this keyer or
                    // the dispatcher, and either would need `Inner`'s mutex
                    // again on this same thread.
                    if let Some(down) = edge {
                        Self::invoke_keying(&keying_cb, down);
                    }
                    std::thread::sleep(Duration::from_micros(dur.max(0) as u64));

                    let mut guard = inner.lock().unwrap();
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    let _ = sink.lock().unwrap().set_tone(ToneState::Silent);
                    let edge = Self::keying_edge(&mut guard.last_key_down, false);
                    guard.state = KeyerState::After(elem, mode);
                    guard.state_gen += 1;
                    drop(guard);
                    cv.notify_all();
                    if let Some(down) = edge {
                        Self::invoke_keying(&keying_cb, down);
                    }

                    let eoe = timing.lock().unwrap().eoe_delay;
                    std::thread::sleep(Duration::from_micros(eoe.max(0) as u64));

                    let mut guard = inner.lock().unwrap();
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    Self::after_logic(&mut guard, elem, mode);
                    guard.state_gen += 1;
                    if guard.state == KeyerState::Idle {
                        dispatcher.schedule_finalization();
                    } else {
                        dispatcher.cancel_finalization();
                    }
                    drop(guard);
                    cv.notify_all();
                }
            }
        }
    }

    /// Returns the keying edge to invoke, if any — pure `Inner` mutation,
    /// no callback access, so this is safe to call while `guard` is held.
    fn start_sounding(guard: &mut Inner, sink: &Arc<Mutex<Sink>>, timing: &Arc<Mutex<ElementTiming>>) -> Option<bool> {
        let t = *timing.lock().unwrap();
        {
            let mut s = sink.lock().unwrap();
            s.set_frequency(t.frequency_hz);
            s.set_volume(t.volume_percent);
            let _ = s.set_tone(ToneState::Sounding);
        }
        Self::keying_edge(&mut guard.last_key_down, true)
    }

    fn keying_edge(last: &mut bool, down: bool) -> Option<bool> {
        if *last != down {
            *last = down;
            Some(down)
        } else {
            None
        }
    }

    /// Locks `keying_cb`'s own mutex, separate from `Inner`'s — callers must
    /// not hold `Inner`'s guard when calling this.
    fn invoke_keying(cb: &Arc<Mutex<Option<KeyingCallback>>>, down: bool) {
        if let Some(f) = cb.lock().unwrap().as_mut() {
            f(down);
        }
    }

    /// §4.6 `AFTER_DOT_*` / `AFTER_DASH_*`. The Mode-B unconditional branch
    /// is reproduced exactly as specified — it differs from the usual Mode-B
    /// description and is not "fixed" here.
    fn after_logic(guard: &mut Inner, elem: Element, mode: Mode) {
        match elem {
            Element::Dot => {
                if !guard.dot_paddle {
                    guard.dot_latch = false;
                }
            }
            Element::Dash => {
                if !guard.dash_paddle {
                    guard.dash_latch = false;
                }
            }
        }

        if mode == Mode::B {
            let next = elem.opposite();
            guard.state = KeyerState::In(next, Mode::B);
            guard.last_element = Some(next);
            return;
        }

        let opposite = elem.opposite();
        let opposite_latched = match opposite {
            Element::Dot => guard.dot_latch,
            Element::Dash => guard.dash_latch,
        };
        let same_latched = match elem {
            Element::Dot => guard.dot_latch,
            Element::Dash => guard.dash_latch,
        };

        if opposite_latched {
            let next_mode = if guard.curtis_b_latch {
                guard.curtis_b_latch = false;
                Mode::B
            } else {
                Mode::A
            };
            guard.state = KeyerState::In(opposite, next_mode);
            guard.last_element = Some(opposite);
        } else if same_latched {
            guard.state = KeyerState::In(elem, Mode::A);
            guard.last_element = Some(elem);
        } else {
            guard.state = KeyerState::Idle;
        }
    }

    fn nudge_from_idle(&self, guard: &mut Inner) {
        let start = if guard.dot_latch && guard.dash_latch {
            match guard.last_element {
                Some(Element::Dot) => Element::Dash,
                Some(Element::Dash) => Element::Dot,
                None => Element::Dot,
            }
        } else if guard.dash_latch {
            Element::Dash
        } else {
            Element::Dot
        };
        let mode = if guard.curtis_b_latch {
            guard.curtis_b_latch = false;
            Mode::B
        } else {
            Mode::A
        };
        guard.state = KeyerState::In(start, mode);
        guard.last_element = Some(start);
        guard.state_gen += 1;
    }

    // ── public API ───────────────────────────────────────────────────────

    pub fn set_curtis_mode_b(&self, enabled: bool) {
        self.curtis_mode_b.store(enabled, Ordering::SeqCst);
    }

    pub fn notify_paddles(&self, dot: bool, dash: bool, busy_external: bool) -> CwResult<()> {
        if busy_external {
            return Err(CwError::busy("tone queue or straight key is active"));
        }
        let mut guard = self.inner.lock().unwrap();
        let dot_rising = dot && !guard.dot_paddle;
        let dash_rising = dash && !guard.dash_paddle;
        guard.dot_paddle = dot;
        guard.dash_paddle = dash;
        if dot_rising {
            guard.dot_latch = true;
        }
        if dash_rising {
            guard.dash_latch = true;
        }
        if self.curtis_mode_b.load(Ordering::SeqCst) && dot && dash {
            guard.curtis_b_latch = true;
        }
        if guard.state == KeyerState::Idle && (guard.dot_latch || guard.dash_latch) {
            self.nudge_from_idle(&mut guard);
            self.dispatcher.cancel_finalization();
        }
        drop(guard);
        self.cv.notify_all();
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().state != KeyerState::Idle
    }

    pub fn block_callbacks(&self, block: bool) {
        self.masked.store(block, Ordering::SeqCst);
    }

    pub fn wait_for_element(&self) -> CwResult<()> {
        if self.masked.load(Ordering::SeqCst) {
            return Err(CwError::deadlock());
        }
        let guard = self.inner.lock().unwrap();
        let start = guard.state_gen;
        let _g = self
            .cv
            .wait_while(guard, |g| g.state_gen < start + 2)
            .unwrap();
        Ok(())
    }

    pub fn wait_for_keyer(&self) -> CwResult<()> {
        if self.masked.load(Ordering::SeqCst) {
            return Err(CwError::deadlock());
        }
        let guard = self.inner.lock().unwrap();
        if guard.dot_paddle || guard.dash_paddle {
            return Err(CwError::deadlock());
        }
        let _g = self
            .cv
            .wait_while(guard, |g| g.state != KeyerState::Idle)
            .unwrap();
        Ok(())
    }

    pub fn reset(&self) {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.dot_latch = false;
            guard.dash_latch = false;
            guard.curtis_b_latch = false;
            guard.state = KeyerState::Idle;
            guard.last_key_down = false;
        }
        self.curtis_mode_b.store(false, Ordering::SeqCst);
        let _ = self.sink.lock().unwrap().set_tone(ToneState::Silent);
        self.dispatcher.schedule_finalization();
        self.cv.notify_all();
    }
}

impl Drop for Keyer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cv.notify_all();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkFamily;

    fn test_keyer() -> Keyer {
        let sink = Arc::new(Mutex::new(Sink::open(SinkFamily::Silent, "")));
        let dispatcher = Arc::new(Dispatcher::new(Sink::open(SinkFamily::Silent, "")));
        let timing = Arc::new(Mutex::new(ElementTiming {
            dot_len: 2_000,
            dash_len: 6_000,
            eoe_delay: 2_000,
            frequency_hz: 600,
            volume_percent: 70,
        }));
        Keyer::new(sink, dispatcher, timing, Arc::new(Mutex::new(None)))
    }

    #[test]
    fn single_dot_paddle_returns_to_idle() {
        let k = test_keyer();
        k.notify_paddles(true, false, false).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        k.notify_paddles(false, false, false).unwrap();
        k.wait_for_keyer().unwrap();
        assert!(!k.is_busy());
    }

    #[test]
    fn busy_external_rejected() {
        let k = test_keyer();
        let err = k.notify_paddles(true, false, true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
    }

    /// The keying callback runs from the keyer's worker thread on every
    /// element edge; it must not run while that thread's own `Inner` guard
    /// is held, or a callback that calls back into `notify_paddles` would
    /// deadlock on the worker thread.
    #[test]
    fn keying_callback_can_reenter_notify_paddles() {
        let sink = Arc::new(Mutex::new(Sink::open(SinkFamily::Silent, "")));
        let dispatcher = Arc::new(Dispatcher::new(Sink::open(SinkFamily::Silent, "")));
        let timing = Arc::new(Mutex::new(ElementTiming {
            dot_len: 2_000,
            dash_len: 6_000,
            eoe_delay: 2_000,
            frequency_hz: 600,
            volume_percent: 70,
        }));
        let reentered = Arc::new(AtomicBool::new(false));
        let keying_cb: Arc<Mutex<Option<KeyingCallback>>> = Arc::new(Mutex::new(None));
        let k = Arc::new(Keyer::new(sink, dispatcher, timing, Arc::clone(&keying_cb)));

        let k_cb = Arc::clone(&k);
        let reentered_cb = Arc::clone(&reentered);
        *keying_cb.lock().unwrap() = Some(Box::new(move |down| {
            if down && !reentered_cb.swap(true, Ordering::SeqCst) {
                k_cb.notify_paddles(false, false, false).unwrap();
            }
        }));

        k.notify_paddles(true, false, false).unwrap();
        k.wait_for_keyer().unwrap();
        assert!(reentered.load(Ordering::SeqCst));
        assert!(!k.is_busy());
    }

    #[test]
    fn mode_b_squeeze_produces_two_elements() {
        let k = test_keyer();
        k.set_curtis_mode_b(true);
        k.notify_paddles(true, true, false).unwrap();
        std::thread::sleep(Duration::from_millis(1));
        k.notify_paddles(false, false, false).unwrap();
        k.wait_for_keyer().unwrap();
        assert!(!k.is_busy());
    }

    #[test]
    fn masked_wait_for_keyer_is_deadlock() {
        let k = test_keyer();
        k.block_callbacks(true);
        assert_eq!(k.wait_for_keyer().unwrap_err().kind(), crate::error::ErrorKind::Deadlock);
    }

    #[test]
    fn reset_forces_idle() {
        let k = test_keyer();
        k.notify_paddles(true, false, false).unwrap();
        k.reset();
        assert!(!k.is_busy());
    }
}
