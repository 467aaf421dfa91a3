// src/sink/alsa_sink.rs  —  ALSA PCM playback backend
//
// Negotiates S16 format, 44100Hz (falling back to 48000), mono,
// interleaved access, the smallest buffer size the hardware accepts, and a
// period count chosen as the largest the hardware accepts up to 30. Runs a
// background thread that blocks in `writei` one period at a time; an
// underrun is recovered by preparing the handle and continuing, never
// treated as fatal.

use crate::error::{CwError, CwResult};
use crate::generator::{Generator, ToneState};
use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

const PREFERRED_RATE: u32 = 44_100;
const FALLBACK_RATE: u32 = 48_000;
const MAX_PERIODS: u32 = 30;

struct Shared {
    generator: Generator,
}

pub struct AlsaSink {
    shared: Arc<Mutex<Shared>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AlsaSink {
    pub fn new(device: &str) -> CwResult<Self> {
        let name = if device.is_empty() { "default" } else { device };
        let pcm = PCM::new(name, Direction::Playback, false)
            .map_err(|e| CwError::system(format!("opening ALSA device {name}: {e}")))?;

        let period_size = {
            let hwp = HwParams::any(&pcm).map_err(|e| CwError::system(e.to_string()))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| CwError::system(e.to_string()))?;
            hwp.set_format(Format::s16())
                .map_err(|e| CwError::system(e.to_string()))?;
            hwp.set_channels(1).map_err(|e| CwError::system(e.to_string()))?;

            if hwp.set_rate(PREFERRED_RATE, ValueOr::Nearest).is_err() {
                hwp.set_rate(FALLBACK_RATE, ValueOr::Nearest)
                    .map_err(|e| CwError::system(e.to_string()))?;
            }

            hwp.set_buffer_size_near(256).map_err(|e| CwError::system(e.to_string()))?;
            hwp.set_periods_near(MAX_PERIODS, ValueOr::Nearest)
                .map_err(|e| CwError::system(e.to_string()))?;

            pcm.hw_params(&hwp).map_err(|e| CwError::system(e.to_string()))?;
            hwp.get_period_size().map_err(|e| CwError::system(e.to_string()))? as usize
        };

        let rate = pcm
            .hw_params_current()
            .and_then(|hwp| hwp.get_rate())
            .unwrap_or(PREFERRED_RATE);

        pcm.prepare().map_err(|e| CwError::system(e.to_string()))?;

        let shared = Arc::new(Mutex::new(Shared {
            generator: Generator::new(rate),
        }));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            std::thread::spawn(move || run_audio_thread(pcm, period_size, shared, running))
        };

        Ok(Self { shared, running, worker: Some(worker) })
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }

    pub fn set_frequency(&mut self, hz: u32) {
        self.shared.lock().unwrap().generator.set_frequency(hz);
    }

    pub fn set_volume(&mut self, percent: u32) {
        self.shared.lock().unwrap().generator.set_volume(percent);
    }

    pub fn set_tone(&mut self, state: ToneState) -> CwResult<()> {
        self.shared.lock().unwrap().generator.set_tone(state);
        Ok(())
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_audio_thread(pcm: PCM, period_size: usize, shared: Arc<Mutex<Shared>>, running: Arc<AtomicBool>) {
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            log::error!("ALSA io_i16 failed: {e}");
            return;
        }
    };
    let mut buf = vec![0i16; period_size.max(1)];
    while running.load(Ordering::SeqCst) {
        {
            let mut sh = shared.lock().unwrap();
            sh.generator.fill_buffer(&mut buf);
        }
        match io.writei(&buf) {
            Ok(_) => {}
            Err(e) => {
                log::warn!("ALSA underrun or write error, recovering: {e}");
                if let Err(e2) = pcm.prepare() {
                    log::error!("ALSA prepare after underrun failed, stopping: {e2}");
                    break;
                }
            }
        }
    }
}
