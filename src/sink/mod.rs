// src/sink/mod.rs  —  audio sink variant: {silent, console, oss, alsa, cpal}
//
// Replaces the reference's function-pointer dispatch with a tagged enum
// whose arms are the backend families named in §4.4. Open/close/write are
// methods; the background audio thread (soundcard backends only) is owned
// by the arm that needs it.

use crate::error::CwResult;
use crate::generator::ToneState;

pub mod silent;
#[cfg(feature = "audio-cpal")]
pub mod cpal_sink;
#[cfg(all(target_os = "linux", feature = "audio-console"))]
pub mod console;
#[cfg(all(target_os = "linux", feature = "audio-oss"))]
pub mod oss;
#[cfg(all(target_os = "linux", feature = "audio-alsa"))]
pub mod alsa_sink;

pub use silent::SilentSink;

/// Selects which backend family `Sink::open` should try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFamily {
    Silent,
    Console,
    Oss,
    Alsa,
    Cpal,
}

pub enum Sink {
    Silent(SilentSink),
    #[cfg(feature = "audio-cpal")]
    Cpal(cpal_sink::CpalSink),
    #[cfg(all(target_os = "linux", feature = "audio-console"))]
    Console(console::ConsoleSink),
    #[cfg(all(target_os = "linux", feature = "audio-oss"))]
    Oss(oss::OssSink),
    #[cfg(all(target_os = "linux", feature = "audio-alsa"))]
    Alsa(alsa_sink::AlsaSink),
}

impl Sink {
    /// Opens the requested family against `device`; falls back to
    /// `SilentSink` on any error so the engine always has a usable sink.
    pub fn open(family: SinkFamily, device: &str) -> Self {
        let sink = match family {
            SinkFamily::Silent => Some(Sink::Silent(SilentSink::new())),
            #[cfg(feature = "audio-cpal")]
            SinkFamily::Cpal => cpal_sink::CpalSink::new(device).ok().map(Sink::Cpal),
            #[cfg(not(feature = "audio-cpal"))]
            SinkFamily::Cpal => None,
            #[cfg(all(target_os = "linux", feature = "audio-console"))]
            SinkFamily::Console => console::ConsoleSink::new(device).ok().map(Sink::Console),
            #[cfg(not(all(target_os = "linux", feature = "audio-console")))]
            SinkFamily::Console => None,
            #[cfg(all(target_os = "linux", feature = "audio-oss"))]
            SinkFamily::Oss => oss::OssSink::new(device).ok().map(Sink::Oss),
            #[cfg(not(all(target_os = "linux", feature = "audio-oss")))]
            SinkFamily::Oss => None,
            #[cfg(all(target_os = "linux", feature = "audio-alsa"))]
            SinkFamily::Alsa => alsa_sink::AlsaSink::new(device).ok().map(Sink::Alsa),
            #[cfg(not(all(target_os = "linux", feature = "audio-alsa")))]
            SinkFamily::Alsa => None,
        };
        sink.unwrap_or_else(|| {
            log::warn!("sink family {family:?} unavailable, falling back to silent");
            Sink::Silent(SilentSink::new())
        })
    }

    pub fn close(&mut self) {
        match self {
            Sink::Silent(s) => s.close(),
            #[cfg(feature = "audio-cpal")]
            Sink::Cpal(s) => s.close(),
            #[cfg(all(target_os = "linux", feature = "audio-console"))]
            Sink::Console(s) => s.close(),
            #[cfg(all(target_os = "linux", feature = "audio-oss"))]
            Sink::Oss(s) => s.close(),
            #[cfg(all(target_os = "linux", feature = "audio-alsa"))]
            Sink::Alsa(s) => s.close(),
        }
    }

    pub fn set_frequency(&mut self, hz: u32) {
        match self {
            Sink::Silent(s) => s.set_frequency(hz),
            #[cfg(feature = "audio-cpal")]
            Sink::Cpal(s) => s.set_frequency(hz),
            #[cfg(all(target_os = "linux", feature = "audio-console"))]
            Sink::Console(s) => s.set_frequency(hz),
            #[cfg(all(target_os = "linux", feature = "audio-oss"))]
            Sink::Oss(s) => s.set_frequency(hz),
            #[cfg(all(target_os = "linux", feature = "audio-alsa"))]
            Sink::Alsa(s) => s.set_frequency(hz),
        }
    }

    pub fn set_volume(&mut self, percent: u32) {
        match self {
            Sink::Silent(s) => s.set_volume(percent),
            #[cfg(feature = "audio-cpal")]
            Sink::Cpal(s) => s.set_volume(percent),
            #[cfg(all(target_os = "linux", feature = "audio-console"))]
            Sink::Console(s) => s.set_volume(percent),
            #[cfg(all(target_os = "linux", feature = "audio-oss"))]
            Sink::Oss(s) => s.set_volume(percent),
            #[cfg(all(target_os = "linux", feature = "audio-alsa"))]
            Sink::Alsa(s) => s.set_volume(percent),
        }
    }

    pub fn set_tone(&mut self, state: ToneState) -> CwResult<()> {
        match self {
            Sink::Silent(s) => s.set_tone(state),
            #[cfg(feature = "audio-cpal")]
            Sink::Cpal(s) => s.set_tone(state),
            #[cfg(all(target_os = "linux", feature = "audio-console"))]
            Sink::Console(s) => s.set_tone(state),
            #[cfg(all(target_os = "linux", feature = "audio-oss"))]
            Sink::Oss(s) => s.set_tone(state),
            #[cfg(all(target_os = "linux", feature = "audio-alsa"))]
            Sink::Alsa(s) => s.set_tone(state),
        }
    }
}
