// src/sink/silent.rs  —  accepts all calls, advances no state
use crate::error::CwResult;
use crate::generator::ToneState;

pub struct SilentSink;

impl SilentSink {
    pub fn new() -> Self {
        SilentSink
    }

    pub fn close(&mut self) {}
    pub fn set_frequency(&mut self, _hz: u32) {}
    pub fn set_volume(&mut self, _percent: u32) {}
    pub fn set_tone(&mut self, _state: ToneState) -> CwResult<()> {
        Ok(())
    }
}

impl Default for SilentSink {
    fn default() -> Self {
        Self::new()
    }
}
