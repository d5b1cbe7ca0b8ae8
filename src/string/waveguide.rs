//! Digital waveguide string (spec.md §4.1, component C2).
//!
//! A single delay line tuned to the string's period, with a cascaded
//! first-order allpass pair providing inharmonic dispersion and a one-pole
//! loop filter providing frequency-dependent loss. Grounded on the teacher's
//! `engine/modules/karplus_strong.rs` delay-line/damping-filter shape,
//! extended with the dispersion cascade and base/damper reflection split the
//! spec requires.

use crate::math::flush_denormal;

#[derive(Clone, Copy, Default)]
struct Allpass {
    x1: f32,
    y1: f32,
}

impl Allpass {
    #[inline]
    fn process(&mut self, x: f32, a: f32) -> f32 {
        let y = -a * x + self.x1 + a * self.y1;
        self.x1 = x;
        self.y1 = flush_denormal(y);
        self.y1
    }
}

#[derive(Clone, Copy, Default)]
struct OnePoleLp {
    y1: f32,
}

impl OnePoleLp {
    #[inline]
    fn process(&mut self, x: f32, damping: f32) -> f32 {
        self.y1 = flush_denormal((1.0 - damping) * x + damping * self.y1);
        self.y1
    }
}

#[derive(Clone)]
pub struct WaveguideString {
    buffer: Vec<f32>,
    write_pos: usize,
    delay_length: f32,
    dispersion: [Allpass; 2],
    loop_lp: OnePoleLp,
    high_freq_damping: f32,
    base_reflection: f32,
    damper_reflection: f32,
    damped: bool,
}

impl WaveguideString {
    pub fn new(sample_rate: f32, f0: f32) -> Self {
        let delay_length = (sample_rate / f0.max(1.0)).max(4.0);
        let buffer_len = delay_length.ceil() as usize + 4;
        Self {
            buffer: vec![0.0; buffer_len],
            write_pos: 0,
            delay_length,
            dispersion: [Allpass::default(); 2],
            loop_lp: OnePoleLp::default(),
            high_freq_damping: 0.2,
            base_reflection: 0.9995,
            damper_reflection: 0.92,
            damped: true,
        }
    }

    pub fn delay_length(&self) -> f32 {
        self.delay_length
    }

    pub fn retune(&mut self, sample_rate: f32, f0: f32) {
        let delay_length = (sample_rate / f0.max(1.0)).max(4.0);
        let needed = delay_length.ceil() as usize + 4;
        if needed > self.buffer.len() {
            self.buffer.resize(needed, 0.0);
        }
        self.delay_length = delay_length;
    }

    pub fn set_high_freq_damping(&mut self, damping: f32) {
        self.high_freq_damping = damping.clamp(0.0, 0.99);
    }

    pub fn set_damper_reflection(&mut self, reflection: f32) {
        self.damper_reflection = reflection;
    }

    pub fn set_damped(&mut self, damped: bool) {
        self.damped = damped;
    }

    #[inline]
    fn reflection(&self) -> f32 {
        if self.damped {
            self.damper_reflection
        } else {
            self.base_reflection
        }
    }

    #[inline]
    fn read_fractional(&self) -> f32 {
        let len = self.buffer.len() as f32;
        // read position, measured backwards from write_pos by delay_length.
        let mut read_pos = self.write_pos as f32 - self.delay_length;
        while read_pos < 0.0 {
            read_pos += len;
        }
        let i0 = read_pos.floor() as usize % self.buffer.len();
        let i1 = (i0 + 1) % self.buffer.len();
        let frac = read_pos - read_pos.floor();
        self.buffer[i0] + (self.buffer[i1] - self.buffer[i0]) * frac
    }

    /// Advance the string by one sample. External forces (hammer contact,
    /// sparse coupling, sympathetic resonance) are delivered separately via
    /// [`Self::inject_force_at_position`] / [`Self::strike`] and land in the
    /// delay line directly, per spec.md §4.1. Returns the pre-filter output
    /// sample.
    pub fn process(&mut self, inharmonicity: f32) -> f32 {
        let out = self.read_fractional();

        let a = -0.85 * inharmonicity;
        let mut y = self.dispersion[0].process(out, a);
        y = self.dispersion[1].process(y, a);
        y = self.loop_lp.process(y, self.high_freq_damping);
        y *= self.reflection();

        let existing = self.buffer[self.write_pos];
        self.buffer[self.write_pos] = flush_denormal(y + existing);
        self.write_pos = (self.write_pos + 1) % self.buffer.len();

        out
    }

    /// Inject a single-sample force at a fractional position along the
    /// string (0 = bridge, 1 = far end).
    pub fn inject_force_at_position(&mut self, force: f32, position: f32) {
        let len = self.buffer.len();
        let offset = ((len as f32) * position.clamp(0.0, 1.0)).floor() as usize;
        let idx = (self.write_pos + offset) % len;
        self.buffer[idx] = flush_denormal(self.buffer[idx] + force);
    }

    /// Inject a bipolar triangular strike profile (hammer contact pulse),
    /// whose window width scales with `strike_position`.
    pub fn strike(&mut self, force: f32, strike_position: f32) {
        let len = self.buffer.len();
        let max_window = (len.saturating_sub(1)).max(4);
        let window_len = (4.0 + strike_position.clamp(0.0, 1.0) * (max_window as f32 - 4.0))
            .round()
            .clamp(4.0, max_window as f32) as usize;
        let half = window_len as f32 / 2.0;
        for i in 0..window_len {
            let fi = i as f32;
            let v = if fi < half {
                fi / half
            } else {
                -(fi - half) / (window_len as f32 - half)
            };
            let idx = (self.write_pos + i) % len;
            self.buffer[idx] = flush_denormal(self.buffer[idx] + force * v);
        }
    }

    pub fn clear(&mut self) {
        self.buffer.iter_mut().for_each(|s| *s = 0.0);
        self.dispersion = [Allpass::default(); 2];
        self.loop_lp = OnePoleLp::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuned_period_matches_expected_sample_count() {
        let s = WaveguideString::new(48_000.0, 440.0);
        assert!((s.delay_length - 48_000.0 / 440.0).abs() < 1e-3);
    }

    #[test]
    fn undriven_string_decays_to_silence() {
        let mut s = WaveguideString::new(48_000.0, 220.0);
        s.set_damped(true);
        s.strike(1.0, 0.2);
        let mut last_energy = f32::INFINITY;
        for block in 0..40 {
            let mut energy = 0.0;
            for _ in 0..1200 {
                let out = s.process(0.0);
                assert!(out.is_finite());
                energy += out * out;
            }
            if block > 4 {
                assert!(energy <= last_energy * 1.15, "energy should trend downward once damped");
            }
            last_energy = energy;
        }
        assert!(last_energy < 1e-4);
    }

    #[test]
    fn output_stays_finite_under_repeated_strikes() {
        let mut s = WaveguideString::new(48_000.0, 880.0);
        s.set_damped(false);
        for _ in 0..10 {
            s.strike(2.0, 0.5);
            for _ in 0..500 {
                assert!(s.process(0.5).is_finite());
            }
        }
    }
}
