// End-to-end scenarios against the public `cw_engine::Engine` API — no
// access to any subsystem's internals, only what an embedder would call.

use cw_engine::{Engine, ErrorKind, RepresentationLookup, SinkFamily, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

struct ParisLookup;

impl RepresentationLookup for ParisLookup {
    fn representation_to_char(&self, representation: &str) -> Option<char> {
        match representation {
            ".--." => Some('P'),
            ".-" => Some('A'),
            ".-." => Some('R'),
            ".." => Some('I'),
            "..." => Some('S'),
            "---" => Some('O'),
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
            'O' => Some("---"),
            _ => None,
        }
    }
}

fn engine() -> Engine {
    Engine::new(SinkFamily::Silent, "")
}

fn us(total: i64) -> Timestamp {
    Timestamp { sec: total / 1_000_000, usec: total % 1_000_000 }
}

/// Scenario 1 — send "PARIS" at 12 WPM: the whole string is accepted and
/// the queue fully drains without error.
#[test]
fn send_paris_at_twelve_wpm_drains_cleanly() {
    let e = engine();
    e.set_send_speed(12).unwrap();
    e.send_string("PARIS", &ParisLookup).unwrap();
    assert!(e.queue_length() > 0);
    e.wait_for_queue().unwrap();
    assert_eq!(e.queue_length(), 0);
    assert!(!e.is_busy());
}

/// Scenario 2 — receive "SOS" via `start_tone`/`end_tone`, reading out each
/// character once its trailing gap resolves past `eoe_max`.
#[test]
fn receive_sos_by_elements() {
    let e = engine();
    e.set_recv_speed(12).unwrap();

    let mut t: i64 = 0;
    // `mark_usec` is 100_000 for a dot, 300_000 for a dash at 12 WPM.
    let mut send_char = |e: &Engine, t: &mut i64, mark_usec: i64, count: usize| -> char {
        for _ in 0..count {
            e.start_tone(Some(us(*t))).unwrap();
            *t += mark_usec;
            e.end_tone(Some(us(*t))).unwrap();
            *t += 100_000; // inter-element gap
        }
        // push past eoe_max (150_000us) into the end-of-character window.
        *t += 300_000;
        let out = e.character(Some(us(*t)), &ParisLookup).unwrap();
        e.clear_receive_buffer();
        out.character
    };

    assert_eq!(send_char(&e, &mut t, 100_000, 3), 'S'); // "..."
    assert_eq!(send_char(&e, &mut t, 300_000, 3), 'O'); // "---"
    assert_eq!(send_char(&e, &mut t, 100_000, 3), 'S'); // "..."
}

/// Scenario 3 — a mark shorter than the noise threshold is rejected and
/// does not disturb the buffer; the next, properly-timed element still
/// reads back correctly.
#[test]
fn noise_spike_is_rejected_then_recovery_reads_correctly() {
    let e = engine();
    e.set_recv_speed(12).unwrap();
    e.set_noise_threshold(10_000).unwrap();

    let mut t: i64 = 0;
    e.start_tone(Some(us(t))).unwrap();
    t += 2_000; // well under the 10ms noise threshold
    let err = e.end_tone(Some(us(t))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Ignored);

    // buffer is untouched: a clean "I" (dot dot) immediately afterward
    // still classifies normally.
    t += 5_000;
    for _ in 0..2 {
        e.start_tone(Some(us(t))).unwrap();
        t += 100_000;
        e.end_tone(Some(us(t))).unwrap();
        t += 100_000;
    }
    t += 300_000; // past eoe_max (150_000) and within eoc_max (500_000)
    let out = e.character(Some(us(t)), &ParisLookup).unwrap();
    assert_eq!(out.character, 'I');
}

/// Scenario 4 — adaptive receive tracks a steady stream of elements and the
/// derived receive speed settles near the actual sending rate rather than
/// staying pinned at the default.
#[test]
fn adaptive_tracking_converges_toward_actual_speed() {
    let e = engine();
    e.enable_adaptive();
    let default_speed = e.recv_speed();

    // Feed "I" (dot dot) over and over at a steady 60_000us dot length
    // (~20 WPM) so the adaptive threshold walks away from its initial seed
    // and the derived speed tracks the real rate.
    let mut t: i64 = 0;
    for _ in 0..12 {
        e.start_tone(Some(us(t))).unwrap();
        t += 60_000;
        e.end_tone(Some(us(t))).unwrap();
        t += 60_000;
        e.start_tone(Some(us(t))).unwrap();
        t += 60_000;
        e.end_tone(Some(us(t))).unwrap();
        t += 300_000; // end-of-character gap
        let _ = e.representation(Some(us(t)));
        e.clear_receive_buffer();
    }

    assert!(e.is_adaptive());
    assert_ne!(e.recv_speed(), default_speed, "adaptive speed never moved off the default seed");
    let stats = e.get_statistics();
    assert!(stats.dot_stddev_usec >= 0.0);
}

/// Scenario 5 — a low-water callback fires once the queue drains back
/// below the registered level.
#[test]
fn queue_backpressure_fires_low_water_callback() {
    let e = engine();
    e.set_send_speed(60).unwrap(); // fastest legal speed, keeps the test quick

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = Arc::clone(&fired);
    e.register_low_water_callback(
        Some(2),
        Some(Box::new(move || {
            fired_cb.store(true, Ordering::SeqCst);
        })),
    )
    .unwrap();

    for _ in 0..5 {
        e.send_dot().unwrap();
    }
    assert!(e.queue_length() > 2);

    e.wait_for_queue().unwrap();
    assert!(fired.load(Ordering::SeqCst), "low-water callback never fired while draining");
    assert_eq!(e.queue_length(), 0);
}

/// Scenario 6 — squeezing both paddles under Curtis Mode B produces the
/// alternating-element run described in §4.6/§9, and releasing both
/// paddles eventually returns the keyer to idle.
#[test]
fn iambic_mode_b_squeeze_then_release_returns_to_idle() {
    let e = engine();
    e.set_send_speed(40).unwrap(); // short elements, keeps the test quick
    e.set_curtis_mode_b(true);

    let transitions = Arc::new(AtomicU32::new(0));
    let transitions_cb = Arc::clone(&transitions);
    e.register_keying_callback(Some(Box::new(move |_down| {
        transitions_cb.fetch_add(1, Ordering::SeqCst);
    })));

    e.notify_paddles(true, true).unwrap();
    assert!(e.keyer_is_busy());
    std::thread::sleep(std::time::Duration::from_millis(5));
    e.notify_paddles(false, false).unwrap();

    e.wait_for_keyer().unwrap();
    assert!(!e.keyer_is_busy());
    // Mode B's trailing opposite-element run means at least the squeezed
    // element, its Mode-B-forced follow-on, and the drain-out all key up
    // and down at least once.
    assert!(transitions.load(Ordering::SeqCst) >= 4);
}
