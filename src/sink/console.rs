// src/sink/console.rs  —  console-buzzer backend (KIOCSOUND on a tty)
//
// `set_tone(Sounding)` installs a hardware-timer divisor derived from
// `1_193_180 / frequency`; zero volume or Silent installs divisor 0 (off).
// No background thread — the PC speaker is driven directly by the kernel
// once the ioctl is issued. Requires the caller to hold write access to the
// device node, which on most distributions means CAP_SYS_TTYCONFIG or
// group `tty` membership.

use crate::error::{CwError, CwResult};
use crate::generator::ToneState;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

const KIOCSOUND: libc::c_ulong = 0x4B2F;
const CLOCK_TICK_RATE: u32 = 1_193_180;

pub struct ConsoleSink {
    device: File,
    frequency_hz: u32,
    volume_percent: u32,
}

impl ConsoleSink {
    pub fn new(device: &str) -> CwResult<Self> {
        let path = if device.is_empty() { "/dev/console" } else { device };
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| CwError::system(format!("opening console device {path}: {e}")))?;
        Ok(Self {
            device: file,
            frequency_hz: 800,
            volume_percent: 70,
        })
    }

    pub fn close(&mut self) {
        self.write_divisor(0);
    }

    pub fn set_frequency(&mut self, hz: u32) {
        self.frequency_hz = hz;
    }

    pub fn set_volume(&mut self, percent: u32) {
        self.volume_percent = percent;
    }

    pub fn set_tone(&mut self, state: ToneState) -> CwResult<()> {
        let divisor = match state {
            ToneState::Sounding if self.frequency_hz > 0 && self.volume_percent > 0 => {
                CLOCK_TICK_RATE / self.frequency_hz
            }
            _ => 0,
        };
        self.write_divisor(divisor);
        Ok(())
    }

    fn write_divisor(&self, divisor: u32) {
        // SAFETY: `fd` is a valid, open file descriptor for the lifetime of
        // this call; KIOCSOUND takes an integer argument, not a pointer.
        let ret = unsafe { libc::ioctl(self.device.as_raw_fd(), KIOCSOUND, divisor as libc::c_ulong) };
        if ret != 0 {
            log::warn!("KIOCSOUND ioctl failed: {}", std::io::Error::last_os_error());
        }
    }
}

impl Drop for ConsoleSink {
    fn drop(&mut self) {
        self.write_divisor(0);
    }
}
