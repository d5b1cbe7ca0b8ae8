//! Sympathetic resonance engine (C8): DC-blocks and low-pass filters the
//! bridge mix, then re-injects it into every undamped ("resonance target")
//! string group, per spec.md §4.7.
//!
//! Grounded on `other_examples/bbda4320_...-lib.rs`'s `SympatheticMatrix`
//! idea of feeding a shared bridge signal back into resonant strings, and on
//! the teacher's `engine/dsp/delay.rs` one-pole/DC-blocker filter idiom.

use crate::math::flush_denormal;
use crate::params::ResonanceParams;
use crate::string::StringGroup;

/// Low-pass cutoff applied to the bridge mix before it is redistributed.
const LP_CUTOFF_HZ: f32 = 3200.0;
const DC_POLE: f32 = 0.995;

pub struct ResonanceEngine {
    lp_pole: f32,
    dc_x1: f32,
    dc_y1: f32,
    lp_y1: f32,
}

impl ResonanceEngine {
    pub fn new(sample_rate: f32) -> Self {
        let lp_pole = (-2.0 * std::f32::consts::PI * LP_CUTOFF_HZ / sample_rate).exp();
        Self { lp_pole, dc_x1: 0.0, dc_y1: 0.0, lp_y1: 0.0 }
    }

    /// Filter the bridge mix into a resonance-feed sample. Returns 0.0
    /// without touching filter state when resonance is disabled.
    pub fn process(&mut self, bridge_mix: f32, params: &ResonanceParams) -> f32 {
        if !params.enabled {
            return 0.0;
        }
        let dc = bridge_mix - self.dc_x1 + DC_POLE * self.dc_y1;
        self.dc_x1 = bridge_mix;
        self.dc_y1 = flush_denormal(dc);

        self.lp_y1 = flush_denormal((1.0 - self.lp_pole) * self.dc_y1 + self.lp_pole * self.lp_y1);
        self.lp_y1 * params.gain
    }

    /// Push the filtered resonance feed into every undamped group, honoring
    /// the `per_note_filter` knob (each group's own sympathetic color
    /// filter vs. a flat injection).
    pub fn inject(&self, feed: f32, params: &ResonanceParams, groups: &mut [StringGroup; 128]) {
        if feed == 0.0 {
            return;
        }
        for g in groups.iter_mut() {
            if !g.is_undamped() {
                continue;
            }
            let energy = if params.per_note_filter { g.filter_drive(feed) } else { feed };
            g.inject_resonance(energy);
        }
    }

    pub fn reset(&mut self) {
        self.dc_x1 = 0.0;
        self.dc_y1 = 0.0;
        self.lp_y1 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::midi_to_freq;
    use crate::params::StringModel;

    fn make_groups() -> Vec<StringGroup> {
        (0..128)
            .map(|n| {
                StringGroup::new(
                    48_000.0,
                    n as u8,
                    StringModel::Waveguide,
                    midi_to_freq(n as u8),
                    0.1,
                    0.95,
                    1.0,
                    16,
                    1.0,
                    1.0,
                    12.0,
                )
            })
            .collect()
    }

    #[test]
    fn disabled_resonance_produces_no_feed() {
        let mut engine = ResonanceEngine::new(48_000.0);
        let params = ResonanceParams { enabled: false, ..ResonanceParams::default() };
        assert_eq!(engine.process(1.0, &params), 0.0);
    }

    #[test]
    fn enabled_resonance_tracks_bridge_mix_and_stays_finite() {
        let mut engine = ResonanceEngine::new(48_000.0);
        let params = ResonanceParams::default();
        let mut last = 0.0;
        for i in 0..2000 {
            let bridge = if i < 10 { 1.0 } else { 0.0 };
            last = engine.process(bridge, &params);
            assert!(last.is_finite());
        }
        let _ = last;
    }

    #[test]
    fn inject_only_reaches_undamped_groups() {
        let mut groups_vec = make_groups();
        groups_vec[60].set_key_down(true);
        let groups: &mut [StringGroup; 128] = groups_vec.as_mut_slice().try_into().ok().unwrap();

        let engine = ResonanceEngine::new(48_000.0);
        let params = ResonanceParams::default();
        engine.inject(0.5, &params, groups);

        for s in groups.iter_mut() {
            assert!(s.process_sample(0.1).is_finite());
        }
    }
}
