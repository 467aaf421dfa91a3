// src/dispatcher.rs  —  tick-driven {IDLE, BUSY} state machine over the tone queue
//
// The reference dispatcher is driven by a single-shot timer fired from
// process-wide asynchronous signal delivery. Per §5, a conforming
// implementation may replace that with a dedicated timer thread as long as
// tick delivery stays serialized and blockable — this is that thread: it
// owns the tone queue and alternates between sleeping for an element's
// duration and reacting to `Condvar` notifications (enqueue, shutdown).
//
// The sink itself lives behind a shared `Arc<Mutex<Sink>>` rather than
// inside the dispatcher's own lock: the iambic keyer and straight key sound
// the same physical device directly while the dispatcher is otherwise idle,
// and both piggyback on this dispatcher's finalization countdown instead of
// running a second one (`cancel_finalization` / `schedule_finalization`).

use crate::error::{CwError, CwResult};
use crate::generator::ToneState;
use crate::sink::Sink;
use crate::tone_queue::{Tone, ToneQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Busy,
}

pub type KeyingCallback = Box<dyn FnMut(bool) + Send>;

const FINALIZATION_TICKS: u32 = 10;

struct Inner {
    queue: ToneQueue,
    state: DispatcherState,
    finalize_remaining: Option<u32>,
    last_key_down: bool,
    dequeue_count: u64,
}

type LowWaterCallback = Box<dyn FnMut() + Send>;

/// What a single `tick_busy` step produced, decoupled from invoking either
/// callback: both run after the `Inner` guard that computed them is
/// dropped, since a callback may re-enter the dispatcher (§4.2 "re-entrant
/// enqueue from inside the callback is supported") and `Inner`'s mutex is
/// not reentrant.
struct TickOutcome {
    keying_edge: Option<bool>,
    low_water_crossed: bool,
    sleep_for: Option<Duration>,
}

pub struct Dispatcher {
    inner: Arc<Mutex<Inner>>,
    sink: Arc<Mutex<Sink>>,
    cv: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
    masked: Arc<AtomicBool>,
    keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
    low_water_cb: Arc<Mutex<Option<LowWaterCallback>>>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(sink: Sink) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            queue: ToneQueue::new(),
            state: DispatcherState::Idle,
            finalize_remaining: None,
            last_key_down: false,
            dequeue_count: 0,
        }));
        let sink = Arc::new(Mutex::new(sink));
        let cv = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let keying_cb: Arc<Mutex<Option<KeyingCallback>>> = Arc::new(Mutex::new(None));
        let low_water_cb: Arc<Mutex<Option<LowWaterCallback>>> = Arc::new(Mutex::new(None));

        let worker = {
            let inner = Arc::clone(&inner);
            let sink = Arc::clone(&sink);
            let cv = Arc::clone(&cv);
            let shutdown = Arc::clone(&shutdown);
            let keying_cb = Arc::clone(&keying_cb);
            let low_water_cb = Arc::clone(&low_water_cb);
            std::thread::spawn(move || Self::run(inner, sink, cv, shutdown, keying_cb, low_water_cb))
        };

        Self {
            inner,
            sink,
            cv,
            shutdown,
            masked: Arc::new(AtomicBool::new(false)),
            keying_cb,
            low_water_cb,
            worker: Some(worker),
        }
    }

    /// Lets the keyer and straight key sound the same device directly while
    /// the dispatcher's own queue is empty; mutual exclusion is enforced by
    /// the `Busy` checks in `enqueue` and in those subsystems, not by this
    /// handle itself.
    pub fn sink_handle(&self) -> Arc<Mutex<Sink>> {
        Arc::clone(&self.sink)
    }

    fn run(
        inner: Arc<Mutex<Inner>>,
        sink: Arc<Mutex<Sink>>,
        cv: Arc<Condvar>,
        shutdown: Arc<AtomicBool>,
        keying_cb: Arc<Mutex<Option<KeyingCallback>>>,
        low_water_cb: Arc<Mutex<Option<LowWaterCallback>>>,
    ) {
        loop {
            let mut guard = inner.lock().unwrap();
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match guard.state {
                DispatcherState::Idle => {
                    if guard.finalize_remaining.is_some() {
                        let (mut g2, timeout) =
                            cv.wait_timeout(guard, Duration::from_secs(1)).unwrap();
                        if shutdown.load(Ordering::SeqCst) {
                            return;
                        }
                        if timeout.timed_out() && g2.state == DispatcherState::Idle {
                            match g2.finalize_remaining {
                                Some(n) if n <= 1 => {
                                    g2.finalize_remaining = None;
                                    sink.lock().unwrap().close();
                                    log::debug!("finalization expired, sink closed");
                                }
                                Some(n) => g2.finalize_remaining = Some(n - 1),
                                None => {}
                            }
                        }
                    } else {
                        let _g = cv.wait(guard).unwrap();
                    }
                }
                DispatcherState::Busy => {
                    let outcome = Self::tick_busy(&mut guard, &sink);
                    drop(guard);
                    cv.notify_all();

                    // Callbacks run only now that `Inner`'s guard is gone: a
                    // callback is allowed to re-enter (enqueue, register a
                    // new callback, ...), and doing that while still holding
                    // the guard that produced `outcome` would deadlock on
                    // this same thread.
                    if outcome.low_water_crossed {
                        if let Some(cb) = low_water_cb.lock().unwrap().as_mut() {
                            cb();
                        }
                    }
                    if let Some(down) = outcome.keying_edge {
                        if let Some(cb) = keying_cb.lock().unwrap().as_mut() {
                            cb(down);
                        }
                    }

                    if let Some(d) = outcome.sleep_for {
                        std::thread::sleep(d);
                    }
                }
            }
        }
    }

    /// One pass of §4.3 step 1/2: process the next tone, or go idle if the
    /// queue drained. A zero-duration (directive) tone reports a zero sleep
    /// so the worker loops straight back into `Busy` without a real timer,
    /// rather than draining a run of them under one `Inner` lock — that
    /// would leave no point between directive tones to drop the guard
    /// before a callback's edge/crossing gets invoked.
    fn tick_busy(guard: &mut Inner, sink: &Arc<Mutex<Sink>>) -> TickOutcome {
        match guard.queue.peek() {
            None => {
                let _ = sink.lock().unwrap().set_tone(ToneState::Silent);
                let keying_edge = Self::keying_edge(guard, false);
                guard.state = DispatcherState::Idle;
                guard.finalize_remaining = Some(FINALIZATION_TICKS);
                TickOutcome { keying_edge, low_water_crossed: false, sleep_for: None }
            }
            Some(tone) => {
                let (_, low_water_crossed) = guard.queue.pop();
                guard.dequeue_count += 1;
                let key_down = !tone.is_silent();
                {
                    let mut s = sink.lock().unwrap();
                    s.set_frequency(tone.frequency_hz);
                    let _ = s.set_tone(if key_down { ToneState::Sounding } else { ToneState::Silent });
                }
                let keying_edge = Self::keying_edge(guard, key_down);
                TickOutcome {
                    keying_edge,
                    low_water_crossed,
                    sleep_for: Some(Duration::from_micros(tone.duration_usec)),
                }
            }
        }
    }

    fn keying_edge(guard: &mut Inner, key_down: bool) -> Option<bool> {
        if guard.last_key_down != key_down {
            guard.last_key_down = key_down;
            Some(key_down)
        } else {
            None
        }
    }

    // ── public API ───────────────────────────────────────────────────────

    /// `busy_external` is true when the straight key or keyer currently
    /// owns the sink; the queue itself has no notion of those subsystems,
    /// so the engine passes that check in.
    pub fn enqueue(&self, tone: Tone, busy_external: bool) -> CwResult<()> {
        if busy_external {
            return Err(CwError::busy("straight key or keyer is active"));
        }
        let mut guard = self.inner.lock().unwrap();
        guard.queue.push(tone)?;
        guard.finalize_remaining = None;
        guard.state = DispatcherState::Busy;
        drop(guard);
        self.cv.notify_all();
        Ok(())
    }

    pub fn register_low_water(&self, level: Option<usize>, cb: Option<LowWaterCallback>) -> CwResult<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.queue.register_low_water(level)?;
        }
        *self.low_water_cb.lock().unwrap() = cb;
        Ok(())
    }

    pub fn register_keying_callback(&self, cb: Option<KeyingCallback>) {
        *self.keying_cb.lock().unwrap() = cb;
    }

    pub fn set_volume(&self, percent: u32) {
        self.sink.lock().unwrap().set_volume(percent);
    }

    /// §5 `block_callbacks` — lets the embedder build a critical section
    /// over state it also mutates from the keying callback without racing
    /// the dispatcher thread; every `wait_*` call checks this gate and
    /// fails `Deadlock` instead of blocking forever while it is set.
    pub fn block_callbacks(&self, block: bool) {
        self.masked.store(block, Ordering::SeqCst);
    }

    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::SeqCst)
    }

    /// Cancels any pending finalization countdown — called when the keyer
    /// or straight key becomes active, so the shared sink is not torn down
    /// out from under them.
    pub fn cancel_finalization(&self) {
        self.inner.lock().unwrap().finalize_remaining = None;
    }

    /// Arms the same 10-second/1-second-step countdown used when the tone
    /// queue drains, on behalf of the keyer or straight key going idle.
    pub fn schedule_finalization(&self) {
        {
            let mut guard = self.inner.lock().unwrap();
            if guard.state == DispatcherState::Idle {
                guard.finalize_remaining = Some(FINALIZATION_TICKS);
            }
        }
        self.cv.notify_all();
    }

    pub fn flush(&self) -> CwResult<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.queue.clear();
            let _ = self.sink.lock().unwrap().set_tone(ToneState::Silent);
        }
        self.cv.notify_all();
        if self.masked.load(Ordering::SeqCst) {
            return Ok(());
        }
        let guard = self.inner.lock().unwrap();
        let _g = self
            .cv
            .wait_while(guard, |g| g.state != DispatcherState::Idle)
            .unwrap();
        Ok(())
    }

    pub fn reset(&self) {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.queue.reset();
            let _ = self.sink.lock().unwrap().set_tone(ToneState::Silent);
            guard.state = DispatcherState::Idle;
            guard.finalize_remaining = None;
        }
        self.cv.notify_all();
    }

    pub fn length(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().queue.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().queue.is_full()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().state == DispatcherState::Busy
    }

    pub fn wait_for_tone(&self) -> CwResult<()> {
        if self.masked.load(Ordering::SeqCst) {
            return Err(CwError::deadlock());
        }
        let guard = self.inner.lock().unwrap();
        let start = guard.dequeue_count;
        let _g = self
            .cv
            .wait_while(guard, |g| g.dequeue_count == start)
            .unwrap();
        Ok(())
    }

    pub fn wait_for_queue(&self) -> CwResult<()> {
        if self.masked.load(Ordering::SeqCst) {
            return Err(CwError::deadlock());
        }
        let guard = self.inner.lock().unwrap();
        let _g = self
            .cv
            .wait_while(guard, |g| g.state != DispatcherState::Idle)
            .unwrap();
        Ok(())
    }

    pub fn wait_for_level(&self, n: usize) -> CwResult<()> {
        if self.masked.load(Ordering::SeqCst) {
            return Err(CwError::deadlock());
        }
        let guard = self.inner.lock().unwrap();
        let _g = self.cv.wait_while(guard, |g| g.queue.len() > n).unwrap();
        Ok(())
    }
}

impl Drop for Dispatcher {
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
    use crate::sink::{Sink, SinkFamily};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AOrdering};

    fn test_dispatcher() -> Dispatcher {
        Dispatcher::new(Sink::open(SinkFamily::Silent, ""))
    }

    #[test]
    fn idle_then_busy_on_enqueue() {
        let d = test_dispatcher();
        assert!(!d.is_busy());
        d.enqueue(Tone::new(1000, 600), false).unwrap();
        assert!(d.is_busy());
    }

    #[test]
    fn busy_rejects_enqueue_when_external_busy_flagged() {
        let d = test_dispatcher();
        let err = d.enqueue(Tone::new(1000, 600), true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
    }

    #[test]
    fn drains_and_returns_idle() {
        let d = test_dispatcher();
        d.enqueue(Tone::new(2000, 600), false).unwrap();
        d.wait_for_queue().unwrap();
        assert!(!d.is_busy());
        assert_eq!(d.length(), 0);
    }

    #[test]
    fn keying_callback_fires_on_edges_only() {
        let d = test_dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = Arc::clone(&count);
        d.register_keying_callback(Some(Box::new(move |_down| {
            count_cb.fetch_add(1, AOrdering::SeqCst);
        })));
        d.enqueue(Tone::new(1000, 600), false).unwrap();
        d.enqueue(Tone::new(1000, 700), false).unwrap(); // still sounding, no edge
        d.wait_for_queue().unwrap();
        // one edge up (silent->sounding), one edge down (sounding->silent)
        assert_eq!(count.load(AOrdering::SeqCst), 2);
    }

    #[test]
    fn masked_waits_fail_deadlock() {
        let d = test_dispatcher();
        d.block_callbacks(true);
        assert_eq!(d.wait_for_queue().unwrap_err().kind(), crate::error::ErrorKind::Deadlock);
        assert_eq!(d.wait_for_tone().unwrap_err().kind(), crate::error::ErrorKind::Deadlock);
    }

    /// §4.2: "re-entrant enqueue from inside the callback is supported." A
    /// callback that calls back into `enqueue` must not run while the
    /// worker still holds `Inner`'s guard, or this deadlocks on the worker
    /// thread instead of returning.
    #[test]
    fn keying_callback_can_reenter_enqueue() {
        let d = Arc::new(test_dispatcher());
        let reentered = Arc::new(AtomicBool::new(false));
        let d_cb = Arc::clone(&d);
        let reentered_cb = Arc::clone(&reentered);
        d.register_keying_callback(Some(Box::new(move |down| {
            if down && !reentered_cb.swap(true, AOrdering::SeqCst) {
                d_cb.enqueue(Tone::new(1000, 650), false).unwrap();
            }
        })));
        d.enqueue(Tone::new(1000, 600), false).unwrap();
        d.wait_for_queue().unwrap();
        assert!(reentered.load(AOrdering::SeqCst));
    }

    #[test]
    fn directive_only_tone_does_not_block_drain() {
        let d = test_dispatcher();
        d.enqueue(Tone::new(0, 600), false).unwrap();
        d.enqueue(Tone::new(500, 0), false).unwrap();
        d.wait_for_queue().unwrap();
        assert_eq!(d.length(), 0);
    }
}
