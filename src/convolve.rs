//! Partitioned overlap-add convolution (C9): the two-stage output chain's
//! mono body IR stage and stereo room IR stage, spec.md §4.8.
//!
//! No direct teacher analogue (the teacher's `dsp/reverb.rs` is a one-line
//! stub); built from scratch around `rustfft`, which the teacher already
//! depends on for its spectrum-analyzer view. Fixed 128-sample partitions
//! keep the algorithmic latency constant and bounded regardless of IR
//! length, and the uniformly-partitioned frequency-domain accumulation
//! keeps per-block cost roughly flat as the IR grows.

use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::error::EngineError;

/// Fixed partition length; every IR is split into blocks of this size before
/// being transformed, and every call site feeds/drains samples in multiples
/// of it internally.
pub const PARTITION_SIZE: usize = 128;
const FFT_SIZE: usize = PARTITION_SIZE * 2;

/// A single-channel uniformly-partitioned overlap-add convolver.
pub struct MonoConvolver {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    ir_spectra: Vec<Vec<Complex32>>,
    input_spectra: VecDeque<Vec<Complex32>>,
    accum: Vec<Complex32>,
    carry: [f32; PARTITION_SIZE],
    in_buf: [f32; PARTITION_SIZE],
    in_count: usize,
    out_queue: VecDeque<f32>,
    scratch: Vec<Complex32>,
}

impl MonoConvolver {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let ifft = planner.plan_fft_inverse(FFT_SIZE);
        Self {
            fft,
            ifft,
            ir_spectra: Vec::new(),
            input_spectra: VecDeque::new(),
            accum: vec![Complex32::new(0.0, 0.0); FFT_SIZE],
            carry: [0.0; PARTITION_SIZE],
            in_buf: [0.0; PARTITION_SIZE],
            in_count: 0,
            out_queue: VecDeque::with_capacity(PARTITION_SIZE * 2),
            scratch: vec![Complex32::new(0.0, 0.0); FFT_SIZE],
        }
    }

    /// Replace the impulse response, partitioning it into `FFT_SIZE`-padded
    /// blocks and transforming each once. Resets all streaming state.
    pub fn set_ir(&mut self, ir: &[f32]) {
        self.ir_spectra.clear();
        self.input_spectra.clear();

        if ir.is_empty() {
            self.reset();
            return;
        }

        let num_partitions = ir.len().div_ceil(PARTITION_SIZE);
        for p in 0..num_partitions {
            let start = p * PARTITION_SIZE;
            let end = (start + PARTITION_SIZE).min(ir.len());
            let mut block = vec![Complex32::new(0.0, 0.0); FFT_SIZE];
            for (i, &s) in ir[start..end].iter().enumerate() {
                block[i] = Complex32::new(s, 0.0);
            }
            self.fft.process(&mut block);
            self.ir_spectra.push(block);
        }

        for _ in 0..num_partitions {
            self.input_spectra.push_back(vec![Complex32::new(0.0, 0.0); FFT_SIZE]);
        }

        self.carry = [0.0; PARTITION_SIZE];
        self.out_queue.clear();
        self.in_count = 0;
    }

    pub fn reset(&mut self) {
        for spectrum in self.input_spectra.iter_mut() {
            spectrum.iter_mut().for_each(|c| *c = Complex32::new(0.0, 0.0));
        }
        self.carry = [0.0; PARTITION_SIZE];
        self.out_queue.clear();
        self.in_buf = [0.0; PARTITION_SIZE];
        self.in_count = 0;
    }

    fn has_ir(&self) -> bool {
        !self.ir_spectra.is_empty()
    }

    fn run_partition(&mut self) {
        self.scratch.iter_mut().for_each(|c| *c = Complex32::new(0.0, 0.0));
        for (i, &s) in self.in_buf.iter().enumerate() {
            self.scratch[i] = Complex32::new(s, 0.0);
        }
        self.fft.process(&mut self.scratch);

        if let Some(oldest) = self.input_spectra.pop_back() {
            let mut newest = oldest;
            newest.copy_from_slice(&self.scratch);
            self.input_spectra.push_front(newest);
        }

        self.accum.iter_mut().for_each(|c| *c = Complex32::new(0.0, 0.0));
        for (x, h) in self.input_spectra.iter().zip(self.ir_spectra.iter()) {
            for i in 0..FFT_SIZE {
                self.accum[i] += x[i] * h[i];
            }
        }
        self.ifft.process(&mut self.accum);

        let norm = 1.0 / FFT_SIZE as f32;
        for i in 0..PARTITION_SIZE {
            let y = self.accum[i].re * norm + self.carry[i];
            self.out_queue.push_back(y);
            self.carry[i] = self.accum[PARTITION_SIZE + i].re * norm;
        }
    }

    /// Convolve `input` into `output` (equal length), buffering internally
    /// in fixed partitions. Passes through unchanged when no IR is loaded.
    /// The output stream lags the input by up to one partition.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), output.len());

        if !self.has_ir() {
            output.copy_from_slice(input);
            return;
        }

        for &x in input {
            self.in_buf[self.in_count] = x;
            self.in_count += 1;
            if self.in_count == PARTITION_SIZE {
                self.run_partition();
                self.in_count = 0;
            }
        }

        for o in output.iter_mut() {
            *o = self.out_queue.pop_front().unwrap_or(0.0);
        }
    }
}

impl Default for MonoConvolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Two independent [`MonoConvolver`]s sharing a processing call, used for
/// the stereo room IR stage.
pub struct StereoConvolver {
    left: MonoConvolver,
    right: MonoConvolver,
}

impl StereoConvolver {
    pub fn new() -> Self {
        Self { left: MonoConvolver::new(), right: MonoConvolver::new() }
    }

    pub fn set_ir(&mut self, left: &[f32], right: &[f32]) {
        self.left.set_ir(left);
        self.right.set_ir(right);
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }

    pub fn process(&mut self, input_l: &[f32], input_r: &[f32], out_l: &mut [f32], out_r: &mut [f32]) {
        self.left.process(input_l, out_l);
        self.right.process(input_r, out_r);
    }
}

impl Default for StereoConvolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Resample a mono IR to `target_rate`, using `dasp`'s sinc interpolator
/// when the source rate differs (spec.md §4.8's "IR loaded at a foreign
/// sample rate is resampled before use").
pub fn resample_ir(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    use dasp::interpolate::sinc::Sinc;
    use dasp::ring_buffer::Fixed;
    use dasp::signal::{self, Signal};

    let ring = Fixed::from(vec![[0.0f64]; 50]);
    let sig = signal::from_iter(samples.iter().map(|&s| [s as f64]));
    let sinc = Sinc::new(ring);
    let ratio = source_rate as f64 / target_rate as f64;
    let resampled = sig.from_hz_to_hz(sinc, source_rate as f64, target_rate as f64);

    let out_len = ((samples.len() as f64) / ratio).ceil() as usize;
    resampled.until_exhausted().take(out_len).map(|f| f[0] as f32).collect()
}

/// Load a mono impulse response from a WAV file via `hound`, down-mixing
/// multi-channel files and resampling to `target_rate`.
pub fn load_ir_from_wav(path: &str, target_rate: u32) -> Result<Vec<f32>, EngineError> {
    let mut reader = hound::WavReader::open(path).map_err(|e| EngineError::ResourceLoadFailure {
        context: format!("reading IR `{path}`"),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().filter_map(Result::ok).collect(),
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .filter_map(Result::ok)
                .map(|s| s as f32 / max)
                .collect()
        }
    };

    let mono: Vec<f32> = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(resample_ir(&mono, spec.sample_rate, target_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_ir_passes_through_unchanged() {
        let mut conv = MonoConvolver::new();
        let input = vec![0.1, -0.2, 0.3, 0.4];
        let mut output = vec![0.0; 4];
        conv.process(&input, &mut output);
        assert_eq!(input, output);
    }

    #[test]
    fn impulse_ir_reproduces_input_after_one_partition_latency() {
        let mut conv = MonoConvolver::new();
        let mut ir = vec![0.0; 4];
        ir[0] = 1.0;
        conv.set_ir(&ir);

        let mut input = vec![0.0; PARTITION_SIZE * 3];
        input[0] = 1.0;
        input[10] = 0.5;
        let mut output = vec![0.0; input.len()];
        conv.process(&input, &mut output);

        // output lags input by one partition (algorithmic latency).
        assert!((output[PARTITION_SIZE] - 1.0).abs() < 1e-3);
        assert!((output[PARTITION_SIZE + 10] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn stays_finite_with_a_long_ir() {
        let mut conv = MonoConvolver::new();
        let ir: Vec<f32> = (0..2000).map(|i| (-(i as f32) / 300.0).exp() * 0.01).collect();
        conv.set_ir(&ir);
        let input: Vec<f32> = (0..4096).map(|i| ((i as f32) * 0.01).sin()).collect();
        let mut output = vec![0.0; input.len()];
        conv.process(&input, &mut output);
        assert!(output.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn matches_direct_convolution_reference() {
        let mut conv = MonoConvolver::new();
        let ir: Vec<f32> = (0..10).map(|i| 1.0 / (i as f32 + 1.0)).collect();
        conv.set_ir(&ir);

        let input: Vec<f32> = (0..PARTITION_SIZE * 3).map(|i| ((i as f32) * 0.037).sin() * 0.5).collect();
        let mut output = vec![0.0; input.len()];
        conv.process(&input, &mut output);

        // direct time-domain reference; output lags input by one partition.
        let latency = PARTITION_SIZE;
        for n in 0..(input.len() - latency) {
            let mut expected = 0.0;
            for (k, &h) in ir.iter().enumerate() {
                if n >= k {
                    expected += input[n - k] * h;
                }
            }
            let got = output[n + latency];
            assert!((got - expected).abs() < 1e-3, "mismatch at {n}: got {got} want {expected}");
        }
    }

    #[test]
    fn produces_identical_output_across_repeated_runs() {
        let ir: Vec<f32> = (0..20).map(|i| (-(i as f32) / 5.0).exp()).collect();
        let input: Vec<f32> = (0..PARTITION_SIZE * 2).map(|i| (i as f32 * 0.01).cos()).collect();

        let run = || {
            let mut conv = MonoConvolver::new();
            conv.set_ir(&ir);
            let mut output = vec![0.0; input.len()];
            conv.process(&input, &mut output);
            output
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn reset_clears_convolution_tail_below_threshold() {
        let mut conv = MonoConvolver::new();
        let ir: Vec<f32> = (0..300).map(|i| (-(i as f32) / 50.0).exp()).collect();
        conv.set_ir(&ir);

        let input = vec![1.0; PARTITION_SIZE * 4];
        let mut output = vec![0.0; input.len()];
        conv.process(&input, &mut output);
        assert!(output[output.len() - 1].abs() > 1e-3, "should still be ringing before reset");

        conv.reset();

        let silence = vec![0.0; PARTITION_SIZE * 3];
        let mut post = vec![0.0; silence.len()];
        conv.process(&silence, &mut post);
        assert!(post.iter().all(|s| s.abs() < 1e-7), "reset should silence the carry tail");
    }

    #[test]
    fn stereo_convolver_handles_independent_channel_irs() {
        let mut conv = StereoConvolver::new();
        let mut ir_l = vec![0.0; PARTITION_SIZE];
        ir_l[0] = 1.0;
        let mut ir_r = vec![0.0; PARTITION_SIZE];
        ir_r[5] = 0.5;
        conv.set_ir(&ir_l, &ir_r);

        let input = vec![1.0; PARTITION_SIZE * 2];
        let mut out_l = vec![0.0; input.len()];
        let mut out_r = vec![0.0; input.len()];
        conv.process(&input, &input, &mut out_l, &mut out_r);
        assert!(out_l.iter().all(|s| s.is_finite()));
        assert!(out_r.iter().all(|s| s.is_finite()));
    }
}
