// src/sink/cpal_sink.rs  —  portable sine-tone backend for hosts without
// direct OSS/ALSA/console access (macOS, Windows, or Linux without the
// audio-oss/audio-alsa/audio-console features enabled).
//
// Same cpal stream setup and `Arc<Mutex<SharedState>>` sharing pattern as
// the other backends, but the per-sample synthesis is delegated to
// `Generator` so this backend gets the same phase-continuous sine and
// attack/release envelope as the OSS/ALSA backends instead of an immediate
// on/off sine.

use crate::error::{CwError, CwResult};
use crate::generator::{Generator, ToneState};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use std::sync::{Arc, Mutex};

struct Shared {
    generator: Generator,
}

pub struct CpalSink {
    shared: Arc<Mutex<Shared>>,
    _stream: Stream,
}

// cpal::Stream is !Send on some platforms (it wraps platform handles); the
// stream is only ever touched from the thread that owns the CpalSink and is
// moved, never accessed concurrently, so this is sound.
unsafe impl Send for CpalSink {}

impl CpalSink {
    pub fn new(_device: &str) -> CwResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| CwError::system("no default output device"))?;
        let config = device
            .default_output_config()
            .map_err(|e| CwError::system(e.to_string()))?;
        let sample_rate = config.sample_rate().0;

        let shared = Arc::new(Mutex::new(Shared {
            generator: Generator::new(sample_rate),
        }));

        let st = Arc::clone(&shared);
        let stream = match config.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), st)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), st)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), st)?,
            other => return Err(CwError::system(format!("unsupported sample format {other:?}"))),
        };
        stream.play().map_err(|e| CwError::system(e.to_string()))?;

        Ok(Self { shared, _stream: stream })
    }

    pub fn close(&mut self) {
        self.shared.lock().unwrap().generator.stop_generating();
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

fn build_stream<S>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<Mutex<Shared>>,
) -> CwResult<Stream>
where
    S: cpal::Sample + cpal::SizedSample + cpal::FromSample<i16>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<i16> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [S], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                scratch.clear();
                scratch.resize(frames, 0);
                {
                    let mut sh = shared.lock().unwrap();
                    sh.generator.fill_buffer(&mut scratch);
                }
                for (frame, &sample) in data.chunks_mut(channels).zip(scratch.iter()) {
                    let out = S::from_sample(sample);
                    for s in frame.iter_mut() {
                        *s = out;
                    }
                }
            },
            |e| log::error!("cpal stream error: {e}"),
            None,
        )
        .map_err(|e| CwError::system(e.to_string()))
}
