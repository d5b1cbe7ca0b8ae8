//! String bank (C5): the full 128-note register of [`StringGroup`]s plus the
//! sparse string-to-string coupling graph that ties them together
//! (spec.md §4.4).
//!
//! Grounded on `other_examples/bbda4320_...-lib.rs`'s `SympatheticMatrix`,
//! generalized from its fixed 12-string matrix into a sparse top-K edge list
//! over all 128 notes, and on the teacher's `engine/graph.rs` pattern of
//! keeping a flat adjacency list instead of a graph crate for a small,
//! statically-known node count.

use crate::hammer::HammerExciter;
use crate::math::{freq_to_cents, midi_to_freq};
use crate::params::{CouplingMode, CouplingParams, Parameters, StringModel};
use crate::resonance::ResonanceEngine;
use crate::string::StringGroup;

const NOTE_COUNT: usize = 128;

/// Per-note physical defaults absent an explicit override: higher notes get
/// a touch more inharmonicity (short, stiff speaking length) and a touch
/// less damping headroom than the bass. Neither curve is drawn from the
/// spec; both are an implementation default, recorded in DESIGN.md.
fn default_inharmonicity(note: u8) -> f32 {
    (0.0005 + 0.00045 * (note as f32 - 21.0).max(0.0)).min(0.5)
}

fn default_loss(note: u8) -> f32 {
    (0.90 + 0.0008 * note as f32).clamp(0.85, 0.99)
}

struct CoupledNote {
    f0: f32,
    inharmonicity: f32,
    loss: f32,
}

fn note_state(note: u8, params: &Parameters) -> CoupledNote {
    let overrides = params.per_note.get(&note);
    let f0 = overrides
        .and_then(|o| o.f0)
        .unwrap_or_else(|| midi_to_freq(note));
    let inharmonicity = overrides
        .and_then(|o| o.inharmonicity)
        .unwrap_or_else(|| default_inharmonicity(note));
    let loss = overrides.and_then(|o| o.loss).unwrap_or_else(|| default_loss(note));
    CoupledNote { f0, inharmonicity, loss }
}

/// A single directed coupling edge: energy flows from `neighbor` into the
/// owning note, scaled by `gain`.
#[derive(Clone, Copy)]
struct Edge {
    neighbor: u8,
    gain: f32,
}

fn build_static_edges(note: u8, params: &CouplingParams) -> Vec<Edge> {
    let mut edges = Vec::new();
    let candidates: [(i32, f32); 4] = [
        (12, params.octave_gain),
        (-12, params.octave_gain),
        (7, params.fifth_gain),
        (-7, params.fifth_gain),
    ];
    for (interval, gain) in candidates {
        let n = note as i32 + interval;
        if (0..NOTE_COUNT as i32).contains(&n) {
            edges.push(Edge {
                neighbor: n as u8,
                gain: gain * params.amount,
            });
        }
    }
    edges.truncate(params.max_neighbors);
    edges
}

/// Minimum physical-mode score kept before top-K truncation (spec.md §4.4).
const PHYSICAL_SCORE_THRESHOLD: f32 = 0.0002;
/// Base gain budget a single source distributes across every destination it
/// feeds in physical coupling mode, before `amount`/unison scaling
/// (spec.md §4.4's `couplingPhysicalBaseGain`). An implementation constant,
/// not a literal spec number; chosen to land in the same neighborhood as
/// static mode's `octave_gain`/`fifth_gain` once `amount` is applied.
const PHYSICAL_BASE_GAIN: f32 = 0.05;
/// Highest partial index considered on either side of a harmonic-alignment
/// pair, per spec.md §4.4.
const MAX_PARTIAL: u32 = 8;

/// Harmonic-alignment score between a `source` note (the one supplying
/// energy) and a `dest` note (the one receiving it): sums alignment over
/// every pair of partials `m` (source) and `n` (destination) up to
/// [`MAX_PARTIAL`], combining a Lorentzian bandwidth term and a Gaussian
/// cents-detune term, then scales by the destination's own unison size and
/// a semitone-distance penalty (spec.md §4.4's physical coupling mode).
fn harmonic_score(
    source_f0: f32,
    dest_f0: f32,
    dest_unison_scale: f32,
    semitone_distance: f32,
    params: &CouplingParams,
) -> f32 {
    let mut score = 0.0;
    for m in 1..=MAX_PARTIAL {
        let source_partial = source_f0 * m as f32;
        let weight_m = 1.0 / (m as f32).powf(params.harmonic_falloff);
        for n in 1..=MAX_PARTIAL {
            let dest_partial = dest_f0 * n as f32;
            let weight_n = 1.0 / (n as f32).powf(0.65 * params.harmonic_falloff);

            let delta = (source_partial - dest_partial).abs();
            let bandwidth = 1.8 + 0.003 * source_partial.max(dest_partial);
            let align = 1.0 / (1.0 + (delta / bandwidth).powi(2));

            let cents_off = freq_to_cents(dest_partial, source_partial);
            let detune = (-0.5 * (cents_off / params.detune_sigma_cents).powi(2)).exp();

            score += weight_m * weight_n * align * detune;
        }
    }
    let distance_penalty = 1.0 / (1.0 + semitone_distance.abs() / 12.0).powf(params.distance_exponent);
    score * dest_unison_scale * distance_penalty
}

/// Build the full physical-mode coupling graph in one pass: every
/// destination's top-K neighbors by score, then a second pass that
/// normalizes each *source's* total outgoing gain (summed across every
/// destination it feeds) to `PHYSICAL_BASE_GAIN * amount * source_unison_scale`,
/// per spec.md §4.4.
fn build_physical_edge_graph(
    notes: &[CoupledNote; NOTE_COUNT],
    groups: &[StringGroup; NOTE_COUNT],
    params: &CouplingParams,
) -> Vec<Vec<Edge>> {
    let mut raw: Vec<Vec<(u8, f32)>> = Vec::with_capacity(NOTE_COUNT);
    for dest in 0..NOTE_COUNT as u8 {
        let dest_scale = groups[dest as usize].unison_scale_sqrt();
        let mut scored: Vec<(u8, f32)> = (0..NOTE_COUNT as u8)
            .filter(|&source| source != dest)
            .map(|source| {
                let distance = (dest as f32 - source as f32).abs();
                let score = harmonic_score(notes[source as usize].f0, notes[dest as usize].f0, dest_scale, distance, params);
                (source, score)
            })
            .filter(|&(_, score)| score >= PHYSICAL_SCORE_THRESHOLD)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(params.max_neighbors);
        raw.push(scored);
    }

    let mut source_totals = [0.0f32; NOTE_COUNT];
    for edges in &raw {
        for &(source, score) in edges {
            source_totals[source as usize] += score;
        }
    }

    raw.into_iter()
        .map(|edges| {
            edges
                .into_iter()
                .map(|(source, score)| {
                    let total = source_totals[source as usize];
                    let cap = PHYSICAL_BASE_GAIN * params.amount * groups[source as usize].unison_scale_sqrt();
                    let gain = if total > 0.0 { cap * score / total } else { 0.0 };
                    Edge { neighbor: source, gain }
                })
                .collect()
        })
        .collect()
}

fn build_coupling_graph(
    notes: &[CoupledNote; NOTE_COUNT],
    groups: &[StringGroup; NOTE_COUNT],
    params: &CouplingParams,
) -> Vec<Vec<Edge>> {
    if !params.enabled || matches!(params.mode, CouplingMode::Off) {
        return vec![Vec::new(); NOTE_COUNT];
    }
    match params.mode {
        CouplingMode::Off => vec![Vec::new(); NOTE_COUNT],
        CouplingMode::Static => (0..NOTE_COUNT as u8).map(|note| build_static_edges(note, params)).collect(),
        CouplingMode::Physical => build_physical_edge_graph(notes, groups, params),
    }
}

/// The full register: 128 string groups, their per-note physical state, and
/// the sparse coupling graph between them.
pub struct StringBank {
    sample_rate: f32,
    groups: Box<[StringGroup; NOTE_COUNT]>,
    inharmonicities: [f32; NOTE_COUNT],
    coupling_edges: Vec<Vec<Edge>>,
    active_notes: Vec<u8>,
}

fn build_groups(sample_rate: f32, model: StringModel, params: &Parameters) -> (Box<[StringGroup; NOTE_COUNT]>, [CoupledNote; NOTE_COUNT]) {
    let notes: Vec<CoupledNote> = (0..NOTE_COUNT as u8).map(|n| note_state(n, params)).collect();
    let groups: Vec<StringGroup> = (0..NOTE_COUNT)
        .map(|i| {
            let n = &notes[i];
            StringGroup::new(
                sample_rate,
                i as u8,
                model,
                n.f0,
                n.inharmonicity,
                n.loss,
                params.unison.detune_scale,
                params.modal.partial_count,
                params.modal.gain_exponent,
                params.modal.undamped_loss_multiplier,
                params.modal.damped_loss_multiplier,
            )
        })
        .collect();
    let groups: Box<[StringGroup; NOTE_COUNT]> = groups.into_boxed_slice().try_into().ok().unwrap();
    let notes_array: [CoupledNote; NOTE_COUNT] = notes.try_into().ok().unwrap();
    (groups, notes_array)
}

impl StringBank {
    pub fn new(sample_rate: f32, params: &Parameters) -> Self {
        let (groups, notes) = build_groups(sample_rate, params.string_model, params);
        let coupling_edges = build_coupling_graph(&notes, &groups, &params.coupling);
        let inharmonicities = std::array::from_fn(|i| notes[i].inharmonicity);

        let mut bank = Self {
            sample_rate,
            groups,
            inharmonicities,
            coupling_edges,
            active_notes: Vec::new(),
        };
        bank.set_unison_crossfeed(params.unison.crossfeed);
        bank
    }

    fn set_unison_crossfeed(&mut self, crossfeed: f32) {
        for g in self.groups.iter_mut() {
            g.set_crossfeed(crossfeed);
        }
    }

    /// Rebuild every voice for a new string model. Live notes are silenced;
    /// a model swap cannot preserve a waveguide delay line's or a modal
    /// bank's internal state across the change.
    pub fn set_string_model(&mut self, model: StringModel, params: &Parameters) {
        let (groups, notes) = build_groups(self.sample_rate, model, params);
        self.coupling_edges = build_coupling_graph(&notes, &groups, &params.coupling);
        self.groups = groups;
        self.inharmonicities = std::array::from_fn(|i| notes[i].inharmonicity);
        self.set_unison_crossfeed(params.unison.crossfeed);
        self.active_notes.clear();
    }

    /// Rebuild only the coupling graph, e.g. after a coupling-mode or
    /// amount change; leaves all live voices untouched.
    pub fn set_coupling_params(&mut self, params: &Parameters) {
        let notes: Vec<CoupledNote> = (0..NOTE_COUNT as u8).map(|n| note_state(n, params)).collect();
        let notes: [CoupledNote; NOTE_COUNT] = notes.try_into().ok().unwrap();
        self.coupling_edges = build_coupling_graph(&notes, &self.groups, &params.coupling);
    }

    fn mark_active(&mut self, note: u8) {
        if !self.active_notes.contains(&note) {
            self.active_notes.push(note);
        }
    }

    pub fn note_on(&mut self, note: u8, velocity: u8, hammer: &mut HammerExciter, params: &Parameters) {
        let note_idx = note as usize;
        self.groups[note_idx].set_key_down(true);
        self.mark_active(note);

        let strike_position = params
            .per_note
            .get(&note)
            .and_then(|o| o.strike_position)
            .unwrap_or(0.18);
        let initial_force = velocity.max(1) as f32 / 127.0;
        self.groups[note_idx].strike(initial_force, strike_position, params.modal.excitation);

        hammer.trigger(
            note,
            velocity,
            &params.hammer_scales,
            &params.attack_noise,
            &params.soft_pedal,
            params.per_note.get(&note).and_then(|o| o.strike_position),
        );
    }

    pub fn set_key_down(&mut self, note: u8, down: bool) {
        self.groups[note as usize].set_key_down(down);
        if down {
            self.mark_active(note);
        }
    }

    pub fn note_off(&mut self, note: u8) {
        self.groups[note as usize].set_key_down(false);
    }

    pub fn set_sustain(&mut self, down: bool) {
        for g in self.groups.iter_mut() {
            g.set_sustain(down);
        }
    }

    /// Advance the whole register by one sample: hammer injection, sparse
    /// coupling (using the previous sample's bridge outputs, avoiding a
    /// simultaneous solve across the graph), per-note processing, and
    /// sympathetic resonance feed. Returns the raw mono bridge mix.
    pub fn process_sample(
        &mut self,
        hammer: &mut HammerExciter,
        resonance: &mut ResonanceEngine,
        params: &Parameters,
    ) -> f32 {
        hammer.process_sample(&mut self.groups);

        if params.coupling.enabled && !matches!(params.coupling.mode, CouplingMode::Off) {
            let scale = 1.0 / (self.active_notes.len().max(1) as f32).sqrt();
            let max_force = params.coupling.max_force;
            for &note in &self.active_notes {
                let edges = &self.coupling_edges[note as usize];
                if edges.is_empty() {
                    continue;
                }
                let mut force = 0.0;
                for edge in edges {
                    force += self.groups[edge.neighbor as usize].last_sample() * edge.gain;
                }
                force = (force * scale).clamp(-max_force, max_force);
                if force != 0.0 {
                    self.groups[note as usize].inject_coupling_force(force);
                }
            }
        }

        let mut bridge_mix = 0.0;
        for &note in &self.active_notes {
            let idx = note as usize;
            bridge_mix += self.groups[idx].process_sample(self.inharmonicities[idx]);
        }

        let feed = resonance.process(bridge_mix, &params.resonance);
        resonance.inject(feed, &params.resonance, &mut self.groups);

        bridge_mix
    }

    /// End-of-block bookkeeping: sleep quiet voices and rebuild the active
    /// note list from whichever groups remain active.
    pub fn end_block(&mut self, frames: usize) {
        for g in self.groups.iter_mut() {
            g.end_block(frames);
        }
        self.active_notes.retain(|&n| self.groups[n as usize].is_active());
        for (i, g) in self.groups.iter().enumerate() {
            if g.is_active() && !self.active_notes.contains(&(i as u8)) {
                self.active_notes.push(i as u8);
            }
        }
    }

    pub fn active_note_count(&self) -> usize {
        self.active_notes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Parameters {
        Parameters::default()
    }

    #[test]
    fn note_on_marks_note_active() {
        let p = params();
        let mut bank = StringBank::new(48_000.0, &p);
        let mut hammer = HammerExciter::new(48_000.0);
        bank.note_on(60, 100, &mut hammer, &p);
        assert_eq!(bank.active_note_count(), 1);
    }

    #[test]
    fn static_coupling_links_octave_and_fifth() {
        let p = params();
        let bank = StringBank::new(48_000.0, &p);
        let edges = &bank.coupling_edges[60];
        let neighbors: Vec<u8> = edges.iter().map(|e| e.neighbor).collect();
        assert!(neighbors.contains(&72));
        assert!(neighbors.contains(&48));
        assert!(neighbors.contains(&67));
        assert!(neighbors.contains(&53));
    }

    #[test]
    fn physical_coupling_respects_max_neighbors() {
        let mut p = params();
        p.coupling.mode = CouplingMode::Physical;
        p.coupling.max_neighbors = 4;
        let bank = StringBank::new(48_000.0, &p);
        for edges in &bank.coupling_edges {
            assert!(edges.len() <= 4);
        }
    }

    #[test]
    fn physical_coupling_caps_each_sources_total_outgoing_gain() {
        let mut p = params();
        p.coupling.mode = CouplingMode::Physical;
        let bank = StringBank::new(48_000.0, &p);

        let mut outgoing = [0.0f32; NOTE_COUNT];
        for edges in &bank.coupling_edges {
            for edge in edges {
                outgoing[edge.neighbor as usize] += edge.gain;
            }
        }
        for (note, &total) in outgoing.iter().enumerate() {
            let cap = PHYSICAL_BASE_GAIN * p.coupling.amount * bank.groups[note].unison_scale_sqrt();
            assert!(total <= cap + 1.0e-5, "note {note} exceeded its outgoing gain cap: {total} > {cap}");
        }
    }

    #[test]
    fn process_sample_stays_finite_with_several_notes_ringing() {
        let p = params();
        let mut bank = StringBank::new(48_000.0, &p);
        let mut hammer = HammerExciter::new(48_000.0);
        let mut resonance = ResonanceEngine::new(48_000.0);
        bank.note_on(40, 90, &mut hammer, &p);
        bank.note_on(52, 70, &mut hammer, &p);
        bank.note_on(64, 110, &mut hammer, &p);
        for block in 0..20 {
            for _ in 0..64 {
                let out = bank.process_sample(&mut hammer, &mut resonance, &p);
                assert!(out.is_finite(), "diverged at block {block}");
            }
            bank.end_block(64);
        }
    }

    #[test]
    fn sleeping_notes_drop_out_of_active_list() {
        let p = params();
        let mut bank = StringBank::new(48_000.0, &p);
        let mut hammer = HammerExciter::new(48_000.0);
        let mut resonance = ResonanceEngine::new(48_000.0);
        bank.note_on(69, 80, &mut hammer, &p);
        bank.note_off(69);
        for _ in 0..30 {
            for _ in 0..64 {
                bank.process_sample(&mut hammer, &mut resonance, &p);
            }
            bank.end_block(64);
        }
        assert_eq!(bank.active_note_count(), 0);
    }
}
