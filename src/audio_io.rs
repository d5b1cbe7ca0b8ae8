//! Realtime playback host (ambient component): owns a `cpal` output stream
//! and drains [`EngineEvent`]s non-blockingly before each callback renders a
//! block, exactly the pattern in the teacher's `engine/audio.rs`.
//!
//! This module is the "outer surface" the spec's Non-goals exclude from the
//! core engine's scope, but the ambient stack still follows the teacher's
//! idiom rather than falling back to something hand-rolled: `cpal` for the
//! device, `crossbeam-channel` for the control plane, `log` at the
//! boundaries only.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::engine::{Engine, EngineEvent};
use crate::params::Parameters;

/// Messages drained per callback are capped so a control-plane flood can
/// never starve the audio thread of render time.
const MAX_DRAINED_PER_CALLBACK: usize = 32;

pub struct AudioHost {
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
    sample_rate: f32,
    engine: Option<Engine>,
    stream: Option<cpal::Stream>,
}

impl AudioHost {
    pub fn new(params: Parameters) -> Result<Self, String> {
        let (tx, rx) = unbounded();
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "no output device".to_string())?;
        let config = device.default_output_config().map_err(|e| e.to_string())?;
        let sample_rate = config.sample_rate().0 as f32;

        let engine = Engine::new(sample_rate, params).map_err(|e| e.to_string())?;

        Ok(Self {
            tx,
            rx,
            sample_rate,
            engine: Some(engine),
            stream: None,
        })
    }

    pub fn sender(&self) -> Sender<EngineEvent> {
        self.tx.clone()
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn start(&mut self) -> Result<(), String> {
        if self.stream.is_some() {
            return Ok(());
        }
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "no output device".to_string())?;
        let supported = device.default_output_config().map_err(|e| e.to_string())?;
        let channels = supported.channels().max(2) as usize;
        let mut cfg: cpal::StreamConfig = supported.into();
        cfg.channels = 2;

        let rx = self.rx.clone();
        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| "engine already moved into a running stream".to_string())?;

        let err_fn = |e: cpal::StreamError| log::error!("audio stream error: {e}");

        let stream = device
            .build_output_stream(
                &cfg,
                move |data: &mut [f32], _| {
                    let mut drained = 0usize;
                    loop {
                        match rx.try_recv() {
                            Ok(event) => engine.apply_event(event),
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => break,
                        }
                        drained += 1;
                        if drained >= MAX_DRAINED_PER_CALLBACK {
                            break;
                        }
                    }

                    if channels == 2 {
                        engine.process_into(data);
                    } else {
                        // Render stereo then fan out to however many
                        // channels the device actually exposes.
                        let frames = data.len() / channels;
                        let stereo = engine.process(frames);
                        for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                            let l = stereo[frame_idx * 2];
                            let r = stereo[frame_idx * 2 + 1];
                            for (ch, sample) in frame.iter_mut().enumerate() {
                                *sample = if ch % 2 == 0 { l } else { r };
                            }
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| e.to_string())?;

        stream.play().map_err(|e| e.to_string())?;
        self.stream = Some(stream);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stream.take();
    }
}

// Intentionally not Clone: the engine moves into the audio callback once
// `start` runs, mirroring the teacher's `AudioEngine`.
