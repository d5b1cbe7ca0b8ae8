//! Engine facade (C10): wires the string bank, hammer exciter, sympathetic
//! resonance engine, and two-stage convolution chain into the single public
//! surface described in spec.md §4.9/§6.
//!
//! Grounded on the teacher's `engine/graph.rs` (the thing that owns every
//! subsystem and exposes `render_frame`) and `engine/messages.rs` (the
//! event vocabulary the realtime thread drains), generalized from a
//! fixed-module synth graph to this engine's physically-modeled signal path.

use crate::bank::StringBank;
use crate::convolve::{load_ir_from_wav, MonoConvolver, StereoConvolver};
use crate::error::EngineError;
use crate::hammer::HammerExciter;
use crate::params::{CouplingMode, Parameters, StringModel};
use crate::resonance::ResonanceEngine;

/// Control-plane events a realtime host thread drains non-blockingly before
/// rendering each callback, generalized from the teacher's `EngineMsg`.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    KeyDown { note: u8, down: bool },
    SustainPedal(bool),
    SoftPedal(bool),
    SetStringModel(StringModel),
    SetCouplingMode(CouplingMode),
    SetBodyIr(String),
    SetRoomIr(String, String),
}

pub struct Engine {
    sample_rate: f32,
    params: Parameters,
    bank: StringBank,
    hammer: HammerExciter,
    resonance: ResonanceEngine,
    body: MonoConvolver,
    room: StereoConvolver,

    scratch_bridge: Vec<f32>,
    scratch_body_wet: Vec<f32>,
    scratch_body_mixed: Vec<f32>,
    scratch_room_l: Vec<f32>,
    scratch_room_r: Vec<f32>,
}

impl Engine {
    pub fn new(sample_rate: f32, params: Parameters) -> Result<Self, EngineError> {
        params.validate()?;

        let bank = StringBank::new(sample_rate, &params);
        let hammer = HammerExciter::new(sample_rate);
        let resonance = ResonanceEngine::new(sample_rate);
        let body = MonoConvolver::new();
        let room = StereoConvolver::new();

        let mut engine = Self {
            sample_rate,
            params,
            bank,
            hammer,
            resonance,
            body,
            room,
            scratch_bridge: Vec::new(),
            scratch_body_wet: Vec::new(),
            scratch_body_mixed: Vec::new(),
            scratch_room_l: Vec::new(),
            scratch_room_r: Vec::new(),
        };

        let body_path = if engine.params.body_ir_path.is_empty() {
            engine.params.ir_path.clone()
        } else {
            engine.params.body_ir_path.clone()
        };
        if !body_path.is_empty() {
            engine.set_body_ir(&body_path)?;
        }
        if !engine.params.room_ir_path_left.is_empty() && !engine.params.room_ir_path_right.is_empty() {
            let (l, r) = (engine.params.room_ir_path_left.clone(), engine.params.room_ir_path_right.clone());
            engine.set_room_ir(&l, &r)?;
        }

        Ok(engine)
    }

    pub fn note_on(&mut self, note: u8, velocity: u8) {
        self.bank.note_on(note, velocity, &mut self.hammer, &self.params);
    }

    /// Move a key without striking it (silent depress): lifts the damper so
    /// the string can ring sympathetically, without triggering the hammer.
    pub fn key_down(&mut self, note: u8, down: bool) {
        self.bank.set_key_down(note, down);
    }

    pub fn note_off(&mut self, note: u8) {
        self.bank.note_off(note);
    }

    pub fn set_sustain_pedal(&mut self, down: bool) {
        self.bank.set_sustain(down);
    }

    pub fn set_soft_pedal(&mut self, down: bool) {
        self.hammer.set_soft_pedal(down);
    }

    fn apply_string_model(&mut self, model: StringModel) {
        self.params.string_model = model;
        self.bank.set_string_model(model, &self.params);
    }

    fn apply_coupling_mode(&mut self, mode: CouplingMode) {
        self.params.coupling.mode = mode;
        self.bank.set_coupling_params(&self.params);
    }

    /// Switch the string model by name (`"waveguide"`/`"modal"`, spec.md §6).
    /// Returns whether a switch actually happened: `false` on an unrecognized
    /// name or when `model` already matches the current setting, and leaves
    /// all state untouched in either case.
    pub fn set_string_model(&mut self, model: &str) -> bool {
        let Some(model) = StringModel::parse(model) else {
            return false;
        };
        if self.params.string_model == model {
            return false;
        }
        self.apply_string_model(model);
        true
    }

    /// Switch the coupling mode by name (`"off"`/`"static"`/`"physical"`,
    /// spec.md §6). Returns whether a switch actually happened, the same
    /// contract as [`Self::set_string_model`].
    pub fn set_coupling_mode(&mut self, mode: &str) -> bool {
        let Some(mode) = CouplingMode::parse(mode) else {
            return false;
        };
        if self.params.coupling.mode == mode {
            return false;
        }
        self.apply_coupling_mode(mode);
        true
    }

    pub fn set_body_ir(&mut self, path: &str) -> Result<(), EngineError> {
        let ir = load_ir_from_wav(path, self.sample_rate as u32)?;
        self.body.set_ir(&ir);
        self.params.body_ir_path = path.to_string();
        Ok(())
    }

    pub fn set_room_ir(&mut self, left_path: &str, right_path: &str) -> Result<(), EngineError> {
        let left = load_ir_from_wav(left_path, self.sample_rate as u32)?;
        let right = load_ir_from_wav(right_path, self.sample_rate as u32)?;
        self.room.set_ir(&left, &right);
        self.params.room_ir_path_left = left_path.to_string();
        self.params.room_ir_path_right = right_path.to_string();
        Ok(())
    }

    /// Legacy two-path alias for [`Self::set_room_ir`], per spec.md:177's
    /// "`SetIR(l,r)` (legacy alias for room)".
    pub fn set_ir(&mut self, left: &str, right: &str) -> Result<(), EngineError> {
        self.set_room_ir(left, right)
    }

    /// Clear all carried filter/convolution state without touching live
    /// notes or parameters: the convolvers' overlap-add tails and the
    /// resonance engine's DC-blocker/low-pass history.
    pub fn reset(&mut self) {
        self.body.reset();
        self.room.reset();
        self.resonance.reset();
    }

    pub fn apply_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::NoteOn { note, velocity } => self.note_on(note, velocity),
            EngineEvent::NoteOff { note } => self.note_off(note),
            EngineEvent::KeyDown { note, down } => self.key_down(note, down),
            EngineEvent::SustainPedal(down) => self.set_sustain_pedal(down),
            EngineEvent::SoftPedal(down) => self.set_soft_pedal(down),
            EngineEvent::SetStringModel(model) => self.apply_string_model(model),
            EngineEvent::SetCouplingMode(mode) => self.apply_coupling_mode(mode),
            EngineEvent::SetBodyIr(path) => {
                let _ = self.set_body_ir(&path);
            }
            EngineEvent::SetRoomIr(left, right) => {
                let _ = self.set_room_ir(&left, &right);
            }
        }
    }

    fn ensure_scratch(&mut self, frames: usize) {
        if self.scratch_bridge.len() < frames {
            self.scratch_bridge.resize(frames, 0.0);
            self.scratch_body_wet.resize(frames, 0.0);
            self.scratch_body_mixed.resize(frames, 0.0);
            self.scratch_room_l.resize(frames, 0.0);
            self.scratch_room_r.resize(frames, 0.0);
        }
    }

    /// Render `out.len() / 2` interleaved stereo frames directly into a
    /// caller-owned buffer (the realtime path: no allocation once the
    /// scratch buffers have grown to the host's block size).
    pub fn process_into(&mut self, out: &mut [f32]) {
        let frames = out.len() / 2;
        self.ensure_scratch(frames);

        for i in 0..frames {
            self.scratch_bridge[i] = self.bank.process_sample(&mut self.hammer, &mut self.resonance, &self.params);
        }
        self.bank.end_block(frames);

        let body_ir = self.params.effective_body_ir();
        self.body.process(&self.scratch_bridge[..frames], &mut self.scratch_body_wet[..frames]);
        for i in 0..frames {
            self.scratch_body_mixed[i] =
                self.scratch_bridge[i] * body_ir.dry_mix + self.scratch_body_wet[i] * body_ir.wet_mix * body_ir.gain;
        }

        self.room.process(
            &self.scratch_body_mixed[..frames],
            &self.scratch_body_mixed[..frames],
            &mut self.scratch_room_l[..frames],
            &mut self.scratch_room_r[..frames],
        );

        let room_ir = self.params.effective_room_ir();
        let gain = self.params.output_gain;
        for i in 0..frames {
            let dry = self.scratch_body_mixed[i];
            let l = dry * room_ir.dry_mix + self.scratch_room_l[i] * room_ir.wet_mix * room_ir.gain;
            let r = dry * room_ir.dry_mix + self.scratch_room_r[i] * room_ir.wet_mix * room_ir.gain;
            out[i * 2] = l * gain;
            out[i * 2 + 1] = r * gain;
        }
    }

    /// Convenience wrapper over [`Self::process_into`] for offline rendering
    /// and tests; allocates its return buffer.
    pub fn process(&mut self, num_frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; num_frames * 2];
        self.process_into(&mut out);
        out
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn active_note_count(&self) -> usize {
        self.bank.active_note_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_rejects_invalid_parameters() {
        let mut params = Parameters::default();
        params.output_gain = -1.0;
        assert!(Engine::new(48_000.0, params).is_err());
    }

    #[test]
    fn strike_and_render_stays_finite() {
        let mut engine = Engine::new(48_000.0, Parameters::default()).unwrap();
        engine.note_on(60, 100);
        for _ in 0..200 {
            let block = engine.process(128);
            assert!(block.iter().all(|s| s.is_finite()));
        }
        assert_eq!(engine.active_note_count(), 1);
    }

    #[test]
    fn sustain_pedal_keeps_released_note_ringing() {
        let mut engine = Engine::new(48_000.0, Parameters::default()).unwrap();
        engine.set_sustain_pedal(true);
        engine.note_on(60, 100);
        engine.note_off(60);
        for _ in 0..50 {
            engine.process(128);
        }
        assert_eq!(engine.active_note_count(), 1);
    }

    #[test]
    fn releasing_sustain_lets_note_sleep_eventually() {
        let mut engine = Engine::new(48_000.0, Parameters::default()).unwrap();
        engine.note_on(69, 90);
        engine.note_off(69);
        for _ in 0..400 {
            engine.process(128);
        }
        assert_eq!(engine.active_note_count(), 0);
    }

    #[test]
    fn silent_key_down_enables_sympathetic_resonance_without_a_strike() {
        let mut engine = Engine::new(48_000.0, Parameters::default()).unwrap();
        engine.key_down(72, true);
        assert_eq!(engine.active_note_count(), 1);
        engine.note_on(60, 110);
        for _ in 0..200 {
            let block = engine.process(128);
            assert!(block.iter().all(|s| s.is_finite()));
        }
    }

    fn rendered_energy(engine: &mut Engine, frames: usize, blocks: usize) -> f32 {
        let mut energy = 0.0;
        for _ in 0..blocks {
            let block = engine.process(frames);
            energy += block.iter().map(|s| s * s).sum::<f32>();
        }
        energy
    }

    /// A silently key-downed, unstruck note should pick up measurably more
    /// energy from a struck neighbor when resonance is enabled than when it
    /// is disabled: at least twice the disabled baseline's contribution.
    #[test]
    fn resonance_enabled_at_least_doubles_sympathetic_energy_over_disabled() {
        let extra_energy = |resonance_enabled: bool, key_down_target: bool| -> f32 {
            let mut params = Parameters::default();
            params.resonance.enabled = resonance_enabled;
            let mut engine = Engine::new(48_000.0, params).unwrap();
            if key_down_target {
                engine.key_down(72, true);
            }
            engine.note_on(60, 110);
            rendered_energy(&mut engine, 128, 100)
        };

        let extra_on = extra_energy(true, true) - extra_energy(true, false);
        let extra_off = extra_energy(false, true) - extra_energy(false, false);

        assert!(extra_off.abs() < 1e-9, "disabled resonance leaked energy into the silent key-down: {extra_off}");
        assert!(extra_on > 1e-6, "resonance should add measurable sympathetic energy: {extra_on}");
        assert!(extra_on >= 2.0 * extra_off.abs().max(1e-9));
    }

    /// Same shape as the resonance scenario above but for sparse coupling:
    /// an undamped, unstruck octave neighbor should ring at least twice as
    /// much with coupling enabled as with it disabled.
    #[test]
    fn coupling_enabled_at_least_doubles_neighbor_energy_over_disabled() {
        let extra_energy = |coupling_enabled: bool, key_down_target: bool| -> f32 {
            let mut params = Parameters::default();
            params.resonance.enabled = false;
            params.coupling.enabled = coupling_enabled;
            let mut engine = Engine::new(48_000.0, params).unwrap();
            if key_down_target {
                engine.key_down(72, true);
            }
            engine.note_on(60, 110);
            rendered_energy(&mut engine, 128, 100)
        };

        let extra_on = extra_energy(true, true) - extra_energy(true, false);
        let extra_off = extra_energy(false, true) - extra_energy(false, false);

        assert!(extra_off.abs() < 1e-9, "disabled coupling leaked energy into the silent key-down: {extra_off}");
        assert!(extra_on > 1e-6, "coupling should add measurable neighbor energy: {extra_on}");
        assert!(extra_on >= 2.0 * extra_off.abs().max(1e-9));
    }

    #[test]
    fn reset_leaves_engine_usable_without_disturbing_live_notes() {
        let mut engine = Engine::new(48_000.0, Parameters::default()).unwrap();
        engine.note_on(60, 100);
        for _ in 0..20 {
            engine.process(128);
        }
        engine.reset();
        assert_eq!(engine.active_note_count(), 1);
        for _ in 0..20 {
            let block = engine.process(128);
            assert!(block.iter().all(|s| s.is_finite()));
        }
    }
}
