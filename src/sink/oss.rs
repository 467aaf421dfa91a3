// src/sink/oss.rs  —  OSS PCM backend (/dev/dsp)
//
// Opens the device write-only, configures signed 16-bit native-endian mono
// PCM at the preferred sample rate (44100, falling back to 48000), requests
// a small fragment (~2^7 samples), and runs a background thread that
// repeatedly fills a buffer from the shared `Generator` and writes it
// blocking. `set_tone` just flips the generator's ramp direction — the
// actual attack/release happens sample-by-sample inside `fill_buffer`.

use crate::error::{CwError, CwResult};
use crate::generator::{Generator, ToneState};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

// Standard Linux OSS ioctl codes (<sys/soundcard.h>), 32-bit x86/arm layout.
const SNDCTL_DSP_RESET: libc::c_ulong = 0x5000;
const SNDCTL_DSP_SPEED: libc::c_ulong = 0xC004_5002;
const SNDCTL_DSP_STEREO: libc::c_ulong = 0xC004_5003;
const SNDCTL_DSP_SETFMT: libc::c_ulong = 0xC004_5005;
const SNDCTL_DSP_CHANNELS: libc::c_ulong = 0xC004_5006;
const SNDCTL_DSP_SETFRAGMENT: libc::c_ulong = 0xC004_500A;
const AFMT_S16_NE: i32 = 0x10; // AFMT_S16_LE; correct for all currently-supported targets.

const PREFERRED_RATE: u32 = 44_100;
const FALLBACK_RATE: u32 = 48_000;
/// fragstotal=0x32 (50), fragsize=2^7 (128 bytes == 64 16-bit samples).
const FRAGMENT_HINT: i32 = (0x0032 << 16) | 7;

struct Shared {
    generator: Generator,
}

pub struct OssSink {
    shared: Arc<Mutex<Shared>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl OssSink {
    pub fn new(device: &str) -> CwResult<Self> {
        let path = if device.is_empty() { "/dev/dsp" } else { device };
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| CwError::system(format!("opening OSS device {path}: {e}")))?;
        let fd = file.as_raw_fd();

        let mut zero = 0;
        ioctl_set(fd, SNDCTL_DSP_RESET, &mut zero)?;
        let mut fragment_hint = FRAGMENT_HINT;
        ioctl_set(fd, SNDCTL_DSP_SETFRAGMENT, &mut fragment_hint)?;
        let mut fmt = AFMT_S16_NE;
        ioctl_set(fd, SNDCTL_DSP_SETFMT, &mut fmt)?;
        let mut channels = 1;
        ioctl_set(fd, SNDCTL_DSP_CHANNELS, &mut channels)?;
        let mut stereo = 0;
        ioctl_set(fd, SNDCTL_DSP_STEREO, &mut stereo)?;

        let mut rate = PREFERRED_RATE as i32;
        if ioctl_set(fd, SNDCTL_DSP_SPEED, &mut rate).is_err() {
            rate = FALLBACK_RATE as i32;
            ioctl_set(fd, SNDCTL_DSP_SPEED, &mut rate)?;
        }

        let shared = Arc::new(Mutex::new(Shared {
            generator: Generator::new(rate as u32),
        }));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            std::thread::spawn(move || run_audio_thread(file, shared, running))
        };

        Ok(Self { shared, running, worker: Some(worker) })
    }

    pub fn close(&mut self) {
        // Drop `generate` first so the audio thread has time to observe the
        // flag and exit before the fd is released (§4.4).
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

impl Drop for OssSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_audio_thread(mut file: File, shared: Arc<Mutex<Shared>>, running: Arc<AtomicBool>) {
    use std::io::Write;
    let mut buf = vec![0i16; 128];
    while running.load(Ordering::SeqCst) {
        {
            let mut sh = shared.lock().unwrap();
            sh.generator.fill_buffer(&mut buf);
        }
        // SAFETY: reinterpreting an `i16` buffer as bytes for a blocking
        // write to a device opened in native-endian S16 format.
        let bytes = unsafe {
            std::slice::from_raw_parts(buf.as_ptr() as *const u8, buf.len() * 2)
        };
        if let Err(e) = file.write_all(bytes) {
            log::error!("OSS write failed, stopping audio thread: {e}");
            break;
        }
    }
}

fn ioctl_set(fd: i32, request: libc::c_ulong, value: &mut i32) -> CwResult<()> {
    // SAFETY: `value` is a valid pointer to an `i32` for the duration of
    // the call, matching OSS's `_IOWR('P', n, int)` contract.
    let ret = unsafe { libc::ioctl(fd, request, value as *mut i32) };
    if ret != 0 {
        return Err(CwError::system(format!(
            "OSS ioctl {request:#x} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
