//! Typed, validated configuration (spec.md §3 `Parameters`, §4.10, §6).
//!
//! A `Parameters` value is immutable for the duration of a block and mutable
//! only between `Engine::process` calls. It is plain `serde`-serializable
//! data so an external preset loader can hand the engine an already-parsed
//! value without this crate knowing anything about JSON or file formats.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringModel {
    Waveguide,
    Modal,
}

impl StringModel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waveguide" => Some(Self::Waveguide),
            "modal" => Some(Self::Modal),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingMode {
    Off,
    Static,
    Physical,
}

impl CouplingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "static" => Some(Self::Static),
            "physical" => Some(Self::Physical),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HammerScales {
    pub stiffness: f32,
    pub exponent: f32,
    pub damping: f32,
    pub initial_velocity: f32,
    pub contact_time: f32,
}

impl Default for HammerScales {
    fn default() -> Self {
        Self {
            stiffness: 1.0,
            exponent: 1.0,
            damping: 1.0,
            initial_velocity: 1.0,
            contact_time: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AttackNoise {
    /// Level, >= 0. 0 disables the burst entirely.
    pub level: f32,
    /// Duration in milliseconds, <= 20.
    pub duration_ms: f32,
    /// Spectral tilt in dB/octave, <= 0 (0 means unfiltered white noise).
    pub tilt_db_per_oct: f32,
}

impl Default for AttackNoise {
    fn default() -> Self {
        Self {
            level: 0.15,
            duration_ms: 4.0,
            tilt_db_per_oct: -6.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct UnisonParams {
    pub detune_scale: f32,
    /// Crossfeed fraction fed back between unison strings, in [0, 0.01).
    pub crossfeed: f32,
}

impl Default for UnisonParams {
    fn default() -> Self {
        Self {
            detune_scale: 1.0,
            crossfeed: 0.002,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ResonanceParams {
    pub enabled: bool,
    pub gain: f32,
    pub per_note_filter: bool,
}

impl Default for ResonanceParams {
    fn default() -> Self {
        Self {
            enabled: true,
            gain: 0.6,
            per_note_filter: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CouplingParams {
    pub enabled: bool,
    pub mode: CouplingMode,
    pub amount: f32,
    pub octave_gain: f32,
    pub fifth_gain: f32,
    pub max_force: f32,
    /// Per-partial amplitude falloff exponent used in physical-mode scoring.
    pub harmonic_falloff: f32,
    /// Detune tolerance, in cents, for the Gaussian alignment term.
    pub detune_sigma_cents: f32,
    /// Exponent applied to the semitone-distance penalty.
    pub distance_exponent: f32,
    pub max_neighbors: usize,
}

impl Default for CouplingParams {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CouplingMode::Static,
            amount: 0.5,
            octave_gain: 0.02,
            fifth_gain: 0.01,
            max_force: 0.25,
            harmonic_falloff: 1.0,
            detune_sigma_cents: 12.0,
            distance_exponent: 1.0,
            max_neighbors: 6,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SoftPedalParams {
    pub strike_offset: f32,
    pub hardness_scale: f32,
}

impl Default for SoftPedalParams {
    fn default() -> Self {
        Self {
            strike_offset: 0.08,
            hardness_scale: 0.7,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModalParams {
    pub partial_count: usize,
    pub gain_exponent: f32,
    pub excitation: f32,
    pub undamped_loss_multiplier: f32,
    pub damped_loss_multiplier: f32,
}

impl Default for ModalParams {
    fn default() -> Self {
        Self {
            partial_count: 16,
            gain_exponent: 1.0,
            excitation: 1.0,
            undamped_loss_multiplier: 1.0,
            damped_loss_multiplier: 12.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PerNoteOverride {
    pub f0: Option<f32>,
    pub inharmonicity: Option<f32>,
    pub loss: Option<f32>,
    pub strike_position: Option<f32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IrChannelParams {
    pub gain: f32,
    pub dry_mix: f32,
    pub wet_mix: f32,
}

impl Default for IrChannelParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            dry_mix: 0.5,
            wet_mix: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameters {
    pub output_gain: f32,
    pub string_model: StringModel,

    // Legacy single-IR path; honored only when both dual IR paths are empty.
    pub ir_path: String,
    pub ir_gain: f32,
    pub ir_dry: f32,
    pub ir_wet: f32,

    pub body_ir_path: String,
    pub body_ir: IrChannelParams,
    pub room_ir_path_left: String,
    pub room_ir_path_right: String,
    pub room_ir: IrChannelParams,

    pub hammer_scales: HammerScales,
    pub attack_noise: AttackNoise,
    pub unison: UnisonParams,
    pub resonance: ResonanceParams,
    pub coupling: CouplingParams,
    pub soft_pedal: SoftPedalParams,
    pub modal: ModalParams,

    pub per_note: HashMap<u8, PerNoteOverride>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            output_gain: 1.0,
            string_model: StringModel::Waveguide,
            ir_path: String::new(),
            ir_gain: 1.0,
            ir_dry: 0.5,
            ir_wet: 0.5,
            body_ir_path: String::new(),
            body_ir: IrChannelParams::default(),
            room_ir_path_left: String::new(),
            room_ir_path_right: String::new(),
            room_ir: IrChannelParams::default(),
            hammer_scales: HammerScales::default(),
            attack_noise: AttackNoise::default(),
            unison: UnisonParams::default(),
            resonance: ResonanceParams::default(),
            coupling: CouplingParams::default(),
            soft_pedal: SoftPedalParams::default(),
            modal: ModalParams::default(),
            per_note: HashMap::new(),
        }
    }
}

impl Parameters {
    /// Resolves the dual-IR fields, falling back to the legacy single-IR
    /// fields when both dual paths are empty (spec.md §3/§6).
    pub fn effective_body_ir(&self) -> IrChannelParams {
        if self.body_ir_path.is_empty() && self.room_ir_path_left.is_empty() {
            IrChannelParams {
                gain: self.ir_gain,
                dry_mix: self.ir_dry,
                wet_mix: self.ir_wet,
            }
        } else {
            self.body_ir
        }
    }

    pub fn effective_room_ir(&self) -> IrChannelParams {
        if self.body_ir_path.is_empty() && self.room_ir_path_left.is_empty() {
            IrChannelParams {
                gain: self.ir_gain,
                dry_mix: self.ir_dry,
                wet_mix: self.ir_wet,
            }
        } else {
            self.room_ir
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        macro_rules! require {
            ($cond:expr, $field:expr, $reason:expr) => {
                if !$cond {
                    return Err(EngineError::InvalidParameter {
                        field: $field,
                        reason: $reason.to_string(),
                    });
                }
            };
        }

        require!(self.output_gain > 0.0, "output_gain", "must be > 0");
        require!(self.hammer_scales.stiffness > 0.0, "hammer_scales.stiffness", "must be > 0");
        require!(self.hammer_scales.exponent > 0.0, "hammer_scales.exponent", "must be > 0");
        require!(self.hammer_scales.damping > 0.0, "hammer_scales.damping", "must be > 0");
        require!(self.hammer_scales.initial_velocity > 0.0, "hammer_scales.initial_velocity", "must be > 0");
        require!(self.hammer_scales.contact_time > 0.0, "hammer_scales.contact_time", "must be > 0");
        require!(self.attack_noise.level >= 0.0, "attack_noise.level", "must be >= 0");
        require!(self.attack_noise.duration_ms <= 20.0, "attack_noise.duration_ms", "must be <= 20ms");
        require!(self.unison.detune_scale >= 0.0, "unison.detune_scale", "must be >= 0");
        require!(
            (0.0..0.01).contains(&self.unison.crossfeed),
            "unison.crossfeed",
            "must be in [0, 0.01)"
        );
        require!(self.resonance.gain >= 0.0, "resonance.gain", "must be >= 0");
        require!(
            (0.0..=1.0).contains(&self.coupling.amount),
            "coupling.amount",
            "must be in [0, 1]"
        );
        require!(self.coupling.max_neighbors >= 1, "coupling.max_neighbors", "must be >= 1");
        require!(self.soft_pedal.strike_offset > 0.0, "soft_pedal.strike_offset", "must be > 0");
        require!(self.soft_pedal.hardness_scale > 0.0, "soft_pedal.hardness_scale", "must be > 0");

        for (&note, ov) in &self.per_note {
            require!(note <= 127, "per_note key", "note must be in 0..=127");
            if let Some(f0) = ov.f0 {
                require!(f0 > 0.0, "per_note.f0", "must be > 0");
            }
            if let Some(inh) = ov.inharmonicity {
                require!(inh >= 0.0, "per_note.inharmonicity", "must be >= 0");
            }
            if let Some(loss) = ov.loss {
                require!((0.0..=1.0).contains(&loss) && loss > 0.0, "per_note.loss", "must be in (0, 1]");
            }
            if let Some(pos) = ov.strike_position {
                require!(pos > 0.0 && pos < 1.0, "per_note.strike_position", "must be in (0, 1)");
            }
        }

        Ok(())
    }
}
