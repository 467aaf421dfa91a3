// src/straight_key.rs  —  manual straight key input
//
// `notify_event` toggles sound immediately; while held, a recurring
// half-second refresh timer re-issues `set_tone(Sounding)` to keep a
// soundcard backend's buffer primed even though the generator already holds
// steady amplitude. Mutually exclusive with the tone queue and the iambic
// keyer via the same `busy_external` convention used there.

use crate::dispatcher::{Dispatcher, KeyingCallback};
use crate::error::{CwError, CwResult};
use crate::generator::ToneState;
use crate::sink::Sink;
use crate::timing::ElementTiming;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

struct Inner {
    down: bool,
    last_key_down: bool,
    generation: u64,
}

pub struct StraightKey {
    inner: Arc<Mutex<Inner>>,
    cv: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
    masked: Arc<AtomicBool>,
    sink: Arc<Mutex<Sink>>,
    dispatcher: Arc<Dispatcher>,
    timing: Arc<Mutex<ElementTiming>>,
    keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
    worker: Option<JoinHandle<()>>,
}

impl StraightKey {
    pub fn new(
        sink: Arc<Mutex<Sink>>,
        dispatcher: Arc<Dispatcher>,
        timing: Arc<Mutex<ElementTiming>>,
        keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner { down: false, last_key_down: false, generation: 0 }));
        let cv = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let refresh_gen = Arc::new(AtomicU64::new(0));

        let worker = {
            let inner = Arc::clone(&inner);
            let cv = Arc::clone(&cv);
            let shutdown = Arc::clone(&shutdown);
            let sink = Arc::clone(&sink);
            let timing_clone = Arc::clone(&timing);
            let refresh_gen = Arc::clone(&refresh_gen);
            std::thread::spawn(move || Self::run(inner, cv, shutdown, sink, timing_clone, refresh_gen))
        };
        Self {
            inner,
            cv,
            shutdown,
            masked: Arc::new(AtomicBool::new(false)),
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
        timing: Arc<Mutex<ElementTiming>>,
        _refresh_gen: Arc<AtomicU64>,
    ) {
        loop {
            let guard = inner.lock().unwrap();
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            if !guard.down {
                let _g = cv.wait(guard).unwrap();
                continue;
            }
            drop(guard);
            std::thread::sleep(REFRESH_INTERVAL);
            let guard = inner.lock().unwrap();
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            if guard.down {
                let t = *timing.lock().unwrap();
                let mut s = sink.lock().unwrap();
                s.set_frequency(t.frequency_hz);
                s.set_volume(t.volume_percent);
                let _ = s.set_tone(ToneState::Sounding);
            }
        }
    }

    // ── public API ───────────────────────────────────────────────────────

    pub fn notify_event(&self, down: bool, busy_external: bool) -> CwResult<()> {
        if busy_external {
            return Err(CwError::busy("tone queue or keyer is active"));
        }
        let mut guard = self.inner.lock().unwrap();
        if guard.down == down {
            return Ok(()); // no-op on unchanged state, per §4.7
        }
        guard.down = down;
        guard.generation += 1;
        if down {
            self.dispatcher.cancel_finalization();
        }
        {
            let mut s = self.sink.lock().unwrap();
            if down {
                let t = *self.timing.lock().unwrap();
                s.set_frequency(t.frequency_hz);
                s.set_volume(t.volume_percent);
            }
            let _ = s.set_tone(if down { ToneState::Sounding } else { ToneState::Silent });
        }
        let edge = if guard.last_key_down != down {
            guard.last_key_down = down;
            Some(down)
        } else {
            None
        };
        drop(guard);
        self.cv.notify_all();
        // Fired after the `Inner` guard above is gone: the callback may call
        // straight back into this key (or the dispatcher), which would need
        // that same mutex again on this thread.
        if let Some(down) = edge {
            if let Some(f) = self.keying_cb.lock().unwrap().as_mut() {
                f(down);
            }
        }
        if !down {
            self.dispatcher.schedule_finalization();
        }
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().down
    }

    pub fn block_callbacks(&self, block: bool) {
        self.masked.store(block, Ordering::SeqCst);
    }

    pub fn wait_for_keyer(&self) -> CwResult<()> {
        if self.masked.load(Ordering::SeqCst) {
            return Err(CwError::deadlock());
        }
        let guard = self.inner.lock().unwrap();
        let _g = self.cv.wait_while(guard, |g| g.down).unwrap();
        Ok(())
    }
}

impl Drop for StraightKey {
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

    fn test_key() -> StraightKey {
        let sink = Arc::new(Mutex::new(Sink::open(SinkFamily::Silent, "")));
        let dispatcher = Arc::new(Dispatcher::new(Sink::open(SinkFamily::Silent, "")));
        let timing = Arc::new(Mutex::new(ElementTiming {
            dot_len: 2_000,
            dash_len: 6_000,
            eoe_delay: 2_000,
            frequency_hz: 600,
            volume_percent: 70,
        }));
        StraightKey::new(sink, dispatcher, timing, Arc::new(Mutex::new(None)))
    }

    #[test]
    fn down_then_up_returns_not_busy() {
        let k = test_key();
        k.notify_event(true, false).unwrap();
        assert!(k.is_busy());
        k.notify_event(false, false).unwrap();
        assert!(!k.is_busy());
    }

    #[test]
    fn unchanged_state_is_noop() {
        let k = test_key();
        k.notify_event(false, false).unwrap();
        assert!(!k.is_busy());
    }

    #[test]
    fn busy_external_rejected() {
        let k = test_key();
        let err = k.notify_event(true, true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
    }

    /// The keying callback must not run while `notify_event`'s own `Inner`
    /// guard is held, or a callback that re-enters `notify_event` deadlocks
    /// on the calling thread.
    #[test]
    fn keying_callback_can_reenter_notify_event() {
        let sink = Arc::new(Mutex::new(Sink::open(SinkFamily::Silent, "")));
        let dispatcher = Arc::new(Dispatcher::new(Sink::open(SinkFamily::Silent, "")));
        let timing = Arc::new(Mutex::new(ElementTiming {
            dot_len: 2_000,
            dash_len: 6_000,
            eoe_delay: 2_000,
            frequency_hz: 600,
            volume_percent: 70,
        }));
        let reentered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let keying_cb: Arc<Mutex<Option<KeyingCallback>>> = Arc::new(Mutex::new(None));
        let k = Arc::new(StraightKey::new(sink, dispatcher, timing, Arc::clone(&keying_cb)));

        let k_cb = Arc::clone(&k);
        let reentered_cb = Arc::clone(&reentered);
        *keying_cb.lock().unwrap() = Some(Box::new(move |down| {
            if down && !reentered_cb.swap(true, Ordering::SeqCst) {
                k_cb.notify_event(false, false).unwrap();
            }
        }));

        k.notify_event(true, false).unwrap();
        assert!(reentered.load(Ordering::SeqCst));
        assert!(!k.is_busy());
    }

    #[test]
    fn masked_wait_is_deadlock() {
        let k = test_key();
        k.block_callbacks(true);
        assert_eq!(k.wait_for_keyer().unwrap_err().kind(), crate::error::ErrorKind::Deadlock);
    }
}
