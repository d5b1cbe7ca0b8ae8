//! String group (C4): the 1-3 unison strings behind a single MIDI note,
//! plus its per-note sympathetic-resonance filter bank and active/damped
//! bookkeeping (spec.md §4.3).

use crate::math::flush_denormal;
use crate::params::StringModel;

use super::modal::ModalString;
use super::waveguide::WaveguideString;

/// Fixed position for light unison crossfeed, per spec.md §4.3.
const CROSSFEED_POSITION: f32 = 0.92;
/// Fixed position used for sparse-coupling injection, per spec.md §4.4.
const COUPLING_POSITION: f32 = 0.9;
const COUPLING_MODAL_SCALE: f32 = 0.45;
/// Fixed position used for sympathetic-resonance injection, per spec.md §4.7.
const RESONANCE_POSITION: f32 = 0.82;
const RESONANCE_MODAL_SCALE: f32 = 0.55;

const QUIET_BLOCKS_TO_SLEEP: u32 = 24;
const QUIET_RMS_THRESHOLD: f32 = 1.0e-6;

/// Either string model behind the common "ringing group" contract (spec.md
/// §9): the orchestration in [`StringGroup`] is identical regardless of
/// which variant backs a note, only the per-sample math differs.
#[derive(Clone)]
enum Voice {
    Waveguide(Vec<WaveguideString>),
    Modal(Vec<ModalString>),
}

/// Register map: notes below 40 get a single string, 40..69 get two strings
/// detuned by +/-1.8 cents, 70 and above get three strings at -3/0/+3 cents.
fn unison_layout(note: u8) -> &'static [(f32, f32)] {
    if note < 40 {
        &[(0.0, 1.0)]
    } else if note < 70 {
        &[(-1.8, 0.5), (1.8, 0.5)]
    } else {
        &[(-3.0, 1.0 / 3.0), (0.0, 1.0 / 3.0), (3.0, 1.0 / 3.0)]
    }
}

#[derive(Clone, Copy, Default)]
struct Bandpass {
    b0: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
    gain: f32,
}

impl Bandpass {
    fn new(sample_rate: f32, freq: f32, bandwidth_hz: f32, gain: f32) -> Self {
        let q = (freq / bandwidth_hz.max(1.0)).max(0.1);
        let w0 = 2.0 * std::f32::consts::PI * (freq / sample_rate).clamp(0.0, 0.49);
        let alpha = w0.sin() / (2.0 * q);
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b0: alpha / a0,
            b2: -alpha / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
            gain,
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b2 * self.x2 - self.a1 * self.y1 - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = flush_denormal(y);
        self.y1 * self.gain
    }
}

pub struct StringGroup {
    voice: Voice,
    string_gains: Vec<f32>,
    resonance_filters: Vec<Bandpass>,
    key_down: bool,
    sustain_down: bool,
    active: bool,
    quiet_blocks: u32,
    block_energy: f32,
    last_sample: f32,
    unison_scale_sqrt: f32,
    crossfeed: f32,
    f0: f32,
}

impl StringGroup {
    pub fn new(
        sample_rate: f32,
        note: u8,
        model: StringModel,
        f0: f32,
        inharmonicity: f32,
        loss: f32,
        detune_scale: f32,
        modal_partial_count: usize,
        modal_gain_exponent: f32,
        modal_undamped_loss_mult: f32,
        modal_damped_loss_mult: f32,
    ) -> Self {
        let layout = unison_layout(note);
        let string_gains: Vec<f32> = layout.iter().map(|(_, w)| *w).collect();

        let voice = match model {
            StringModel::Waveguide => {
                let strings = layout
                    .iter()
                    .map(|(cents, _)| {
                        let detuned = f0 * 2f32.powf((cents * detune_scale) / 1200.0);
                        let mut s = WaveguideString::new(sample_rate, detuned);
                        s.set_damped(true);
                        s.set_high_freq_damping((1.0 - loss).clamp(0.0, 0.99));
                        s
                    })
                    .collect();
                Voice::Waveguide(strings)
            }
            StringModel::Modal => {
                let strings = layout
                    .iter()
                    .map(|(cents, _)| {
                        let detuned = f0 * 2f32.powf((cents * detune_scale) / 1200.0);
                        ModalString::new(
                            sample_rate,
                            detuned,
                            inharmonicity,
                            loss,
                            modal_partial_count,
                            modal_gain_exponent,
                            modal_undamped_loss_mult,
                            modal_damped_loss_mult,
                        )
                    })
                    .collect();
                Voice::Modal(strings)
            }
        };

        let nyquist = sample_rate * 0.5;
        let partials: [(f32, f32, f32); 3] = [(1.0, 35.0, 1.0), (2.0, 55.0, 0.55), (3.0, 80.0, 0.30)];
        let resonance_filters = partials
            .iter()
            .filter_map(|(mult, bw, gain)| {
                let center = f0 * mult;
                if center >= 0.95 * nyquist {
                    None
                } else {
                    Some(Bandpass::new(sample_rate, center, *bw, *gain))
                }
            })
            .collect();

        let unison_scale_sqrt = (layout.len() as f32 / 3.0).sqrt();

        Self {
            voice,
            string_gains,
            resonance_filters,
            key_down: false,
            sustain_down: false,
            active: false,
            quiet_blocks: 0,
            block_energy: 0.0,
            last_sample: 0.0,
            unison_scale_sqrt,
            crossfeed: 0.0,
            f0,
        }
    }

    pub fn f0(&self) -> f32 {
        self.f0
    }

    pub fn string_count(&self) -> usize {
        self.string_gains.len()
    }

    pub fn unison_scale_sqrt(&self) -> f32 {
        self.unison_scale_sqrt
    }

    pub fn is_undamped(&self) -> bool {
        self.key_down || self.sustain_down
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_key_down(&mut self, down: bool) {
        self.key_down = down;
        self.apply_damper_state();
    }

    pub fn set_sustain(&mut self, down: bool) {
        self.sustain_down = down;
        self.apply_damper_state();
    }

    fn apply_damper_state(&mut self) {
        let damped = !self.is_undamped();
        if let Voice::Waveguide(strings) = &mut self.voice {
            for s in strings {
                s.set_damped(damped);
            }
        }
        if self.is_undamped() {
            self.active = true;
            self.quiet_blocks = 0;
        }
    }

    /// Trigger a hammer strike's initial bipolar pulse.
    pub fn strike(&mut self, force: f32, strike_position: f32, excitation_knob: f32) {
        self.active = true;
        self.quiet_blocks = 0;
        match &mut self.voice {
            Voice::Waveguide(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.strike(force * gain, strike_position);
                }
            }
            Voice::Modal(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.excite(force * gain, strike_position, excitation_knob);
                }
            }
        }
    }

    /// Continuous hammer contact force, injected every sample while the
    /// hammer is touching the string (spec.md §4.6).
    pub fn inject_hammer_force(&mut self, force: f32, strike_position: f32) {
        match &mut self.voice {
            Voice::Waveguide(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.inject_force_at_position(force * gain, strike_position);
                }
            }
            Voice::Modal(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.inject(force * gain, strike_position);
                }
            }
        }
    }

    /// Sparse-coupling injection from another note's bridge sample,
    /// pre-scaled and clamped by the caller (spec.md §4.4).
    pub fn inject_coupling_force(&mut self, force: f32) {
        match &mut self.voice {
            Voice::Waveguide(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.inject_force_at_position(force * gain, COUPLING_POSITION);
                }
            }
            Voice::Modal(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.inject(force * gain * COUPLING_MODAL_SCALE, COUPLING_POSITION);
                }
            }
        }
    }

    /// Sympathetic-resonance injection from the bridge mix (spec.md §4.7).
    pub fn inject_resonance(&mut self, energy: f32) {
        match &mut self.voice {
            Voice::Waveguide(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.inject_force_at_position(energy * gain, RESONANCE_POSITION);
                }
            }
            Voice::Modal(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    s.inject(energy * gain * RESONANCE_MODAL_SCALE, RESONANCE_POSITION);
                }
            }
        }
    }

    /// Run the per-note resonance color filter over `x`, used when
    /// `resonance.per_note_filter` is enabled (spec.md §4.7).
    pub fn filter_drive(&mut self, x: f32) -> f32 {
        self.resonance_filters.iter_mut().map(|f| f.process(x)).sum()
    }

    pub fn process_sample(&mut self, inharmonicity: f32) -> f32 {
        let mut out = 0.0;
        match &mut self.voice {
            Voice::Waveguide(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    out += s.process(inharmonicity) * gain;
                }
            }
            Voice::Modal(strings) => {
                for (s, gain) in strings.iter_mut().zip(&self.string_gains) {
                    out += s.process(!self.is_undamped()) * gain;
                }
            }
        }

        let crossfeed_force = out * self.crossfeed;
        if crossfeed_force != 0.0 {
            match &mut self.voice {
                Voice::Waveguide(strings) => {
                    for s in strings {
                        s.inject_force_at_position(crossfeed_force, CROSSFEED_POSITION);
                    }
                }
                Voice::Modal(strings) => {
                    for s in strings {
                        s.inject(crossfeed_force, CROSSFEED_POSITION);
                    }
                }
            }
        }

        self.last_sample = out;
        self.block_energy += out * out;
        out
    }

    pub fn set_crossfeed(&mut self, crossfeed: f32) {
        self.crossfeed = crossfeed;
    }

    pub fn last_sample(&self) -> f32 {
        self.last_sample
    }

    /// End-of-block bookkeeping (spec.md §4.3): forces `active` while
    /// undamped; otherwise tracks RMS across 24 consecutive quiet blocks
    /// before sleeping the voice.
    pub fn end_block(&mut self, frames: usize) {
        if self.is_undamped() {
            self.active = true;
            self.quiet_blocks = 0;
        } else {
            let rms = (self.block_energy / frames.max(1) as f32).sqrt();
            if rms > QUIET_RMS_THRESHOLD {
                self.quiet_blocks = 0;
            } else {
                self.quiet_blocks += 1;
                if self.quiet_blocks >= QUIET_BLOCKS_TO_SLEEP {
                    self.active = false;
                }
            }
        }
        self.block_energy = 0.0;
    }
}
