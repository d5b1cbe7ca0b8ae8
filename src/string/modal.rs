//! Modal string: a damped-sinusoid resonator bank, the alternative string
//! model to the waveguide (spec.md §4.2, component C3).
//!
//! Each mode is a complex rotator whose magnitude decays geometrically per
//! sample. Grounded on the teacher's `engine/modules/resonator_bank.rs`
//! (harmonic partial bank with inharmonicity-driven detuning and a
//! brightness-controlled decay factor), reworked from direct-form biquads
//! into rotators per spec.md §4.2 and the tagged-variant design note in §9.

use crate::math::flush_denormal;

const HF_DAMPING_BASELINE: f32 = 0.05;

#[derive(Clone, Copy, Default)]
struct Mode {
    cos_w: f32,
    sin_w: f32,
    decay_undamped: f32,
    decay_damped: f32,
    re: f32,
    im: f32,
    gain: f32,
}

impl Mode {
    #[inline]
    fn step(&mut self, damped: bool) -> f32 {
        let decay = if damped { self.decay_damped } else { self.decay_undamped };
        let re = decay * (self.re * self.cos_w - self.im * self.sin_w);
        let im = decay * (self.re * self.sin_w + self.im * self.cos_w);
        self.re = flush_denormal(re);
        self.im = flush_denormal(im);
        self.re * self.gain
    }
}

#[derive(Clone)]
pub struct ModalString {
    modes: Vec<Mode>,
    f0: f32,
}

impl ModalString {
    pub fn new(
        sample_rate: f32,
        f0: f32,
        inharmonicity: f32,
        loss: f32,
        partial_count: usize,
        gain_exponent: f32,
        undamped_loss_multiplier: f32,
        damped_loss_multiplier: f32,
    ) -> Self {
        let mut modes = Vec::with_capacity(partial_count);
        let nyquist = sample_rate * 0.5;
        for i in 1..=partial_count {
            let n = i as f32;
            let freq = f0 * n * (1.0 + 0.12 * inharmonicity * n * n).sqrt();
            if freq >= 0.95 * nyquist {
                break;
            }
            let w = 2.0 * std::f32::consts::PI * freq / sample_rate;
            let per_order_damping = (1.0 + HF_DAMPING_BASELINE * n) * (1.0 - loss).max(1e-6);
            let decay_undamped =
                (-per_order_damping * undamped_loss_multiplier).exp().clamp(0.0, 0.999_999);
            let decay_damped =
                (-per_order_damping * damped_loss_multiplier).exp().clamp(0.0, 0.999_999);
            modes.push(Mode {
                cos_w: w.cos(),
                sin_w: w.sin(),
                decay_undamped,
                decay_damped,
                re: 0.0,
                im: 0.0,
                gain: 1.0 / n.powf(gain_exponent.max(0.0)),
            });
        }
        Self { modes, f0 }
    }

    pub fn f0(&self) -> f32 {
        self.f0
    }

    /// Advance one sample, returning the bridge sample after excitation has
    /// already been distributed across modes for this sample (if any).
    pub fn process(&mut self, damped: bool) -> f32 {
        let mut out = 0.0;
        for m in self.modes.iter_mut() {
            out += m.step(damped);
        }
        out
    }

    /// Distribute a strike force across modes by `sin(pi*n*pos)/n`, scaled
    /// by the caller-supplied group gain and excitation knob.
    pub fn excite(&mut self, force: f32, strike_position: f32, excitation: f32) {
        for (i, m) in self.modes.iter_mut().enumerate() {
            let n = (i + 1) as f32;
            let weight = (std::f32::consts::PI * n * strike_position).sin() / n;
            m.re = flush_denormal(m.re + force * excitation * weight);
        }
    }

    /// Inject a continuous per-sample force (coupling, sympathetic
    /// resonance), distributed with the same per-mode weighting as a strike
    /// but without the excitation knob (the caller has already scaled it).
    pub fn inject(&mut self, force: f32, position: f32) {
        for (i, m) in self.modes.iter_mut().enumerate() {
            let n = (i + 1) as f32;
            let weight = (std::f32::consts::PI * n * position).sin() / n;
            m.re = flush_denormal(m.re + force * weight);
        }
    }

    pub fn clear(&mut self) {
        for m in self.modes.iter_mut() {
            m.re = 0.0;
            m.im = 0.0;
        }
    }

    pub fn mode_count(&self) -> usize {
        self.modes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(f0: f32, inharm: f32, loss: f32) -> ModalString {
        ModalString::new(48_000.0, f0, inharm, loss, 16, 1.0, 1.0, 12.0)
    }

    #[test]
    fn modes_above_nyquist_limit_are_dropped() {
        let s = make(4000.0, 0.0, 0.9);
        assert!(s.mode_count() < 16);
    }

    #[test]
    fn damped_decays_faster_than_undamped() {
        let mut damped = make(220.0, 0.1, 0.9);
        let mut undamped = damped.clone();
        damped.excite(1.0, 0.15, 1.0);
        undamped.excite(1.0, 0.15, 1.0);
        for _ in 0..2000 {
            damped.process(true);
            undamped.process(false);
        }
        let mut damped_energy = 0.0;
        let mut undamped_energy = 0.0;
        for _ in 0..500 {
            let d = damped.process(true);
            let u = undamped.process(false);
            damped_energy += d * d;
            undamped_energy += u * u;
        }
        assert!(damped_energy < undamped_energy);
    }

    #[test]
    fn output_stays_finite() {
        let mut s = make(60.0, 0.8, 0.5);
        s.excite(1.0, 0.1, 1.0);
        for _ in 0..10_000 {
            assert!(s.process(false).is_finite());
        }
    }
}
