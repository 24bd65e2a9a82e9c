//! Live playback state machine (spec component E) and read-only query
//! surface (spec component G).
//!
//! [`Player`] owns one module reference plus one mutable per-context arena
//! (the channel array, tick/row cursor, pattern-loop bookkeeping). It is
//! not a port of an offline scheduler: `E6x` pattern loop resolution has to
//! see the actual row as it is replayed, so jumps/breaks/loops are resolved
//! live, one tick at a time, exactly as spec §4.E's pseudo-protocol
//! describes.

use alloc::vec;
use alloc::vec::Vec;

use xm_ir::{Effect, Module, Slot, VolumeColumn};

use crate::channel::ChannelState;
use crate::frequency::{frequency_to_step, note_to_period, period_to_frequency};
use crate::mixer::{render_channel, Interpolation};

/// Per-(table-index, row) loop counters for `E6x` (spec §4.E, §8 property
/// 7): `E60` sets the loop start row at the current position; `E6x`
/// (x != 0) jumps back to that row up to `x` times before falling through.
#[derive(Clone, Debug, Default)]
struct PatternLoop {
    start_row: u16,
    count: u8,
}

/// A note/instrument/volume-column trigger deferred by `EDx` note delay
/// (spec §4.E) until tick `tick` of the current row.
#[derive(Clone, Copy, Debug)]
struct PendingTrigger {
    slot: Slot,
    tick: u8,
}

/// Where playback should go at the end of the current row (spec §4.E):
/// at most one of a jump-to-table-index or a break-to-row is honored per
/// row, with the last one written on that row's ticks winning.
#[derive(Clone, Copy, Debug, Default)]
struct RowTransition {
    jump_table_index: Option<u16>,
    break_row: Option<u16>,
    pattern_loop_row: Option<u16>,
    pattern_delay: u8,
}

/// The live playback context: one module plus one mutable arena (spec §3).
pub struct Player<'m, 'a> {
    module: &'m Module<'a>,
    sample_rate: u32,
    interpolation: Interpolation,

    channels: Vec<ChannelState>,

    current_table_index: u16,
    current_row: u16,
    current_tick: u8,
    remaining_samples_in_tick: u32,
    tick_fraction_accum: u32,

    tempo: u8,
    bpm: u8,
    global_volume: f32,
    /// Master output scale applied after the mix, defaulting to `0.25`
    /// (`xm_create_context_safe`'s reset value, SPEC_FULL §10) rather than
    /// unity, so a full chord across all channels at max volume/panning
    /// doesn't clip the float output.
    amplification: f32,

    pattern_loops: Vec<Vec<PatternLoop>>,
    pattern_delay_counter: u8,
    row_transition: Option<RowTransition>,
    pending_triggers: Vec<Option<PendingTrigger>>,

    loop_count: u8,
    max_loop_count: u8,
    generated_samples: u64,

    muted_instruments: Vec<bool>,
    /// Per-(instrument, sample) last-trigger sample counter (spec.md §6's
    /// `latest_trigger` query), 1-indexed like `muted_instruments` — index 0
    /// in both dimensions is unused padding so real indices can be used
    /// directly without a `- 1`. `Instrument`/`Sample` are read through an
    /// immutable `&'m Module<'a>` (`module`, above) and hold no writable
    /// trigger-time field of their own, so this side table is the only place
    /// that can record playback-driven state, the same reason
    /// `muted_instruments` exists instead of an `Instrument::muted` flag.
    sample_trigger_times: Vec<Vec<u64>>,
}

impl<'m, 'a> Player<'m, 'a> {
    pub fn new(module: &'m Module<'a>, sample_rate: u32) -> Self {
        Self::with_interpolation(module, sample_rate, Interpolation::Linear)
    }

    pub fn with_interpolation(
        module: &'m Module<'a>,
        sample_rate: u32,
        interpolation: Interpolation,
    ) -> Self {
        let num_channels = module.num_channels as usize;
        let pattern_loops = module
            .patterns
            .iter()
            .map(|_| vec![PatternLoop::default(); num_channels])
            .collect();

        let mut player = Self {
            module,
            sample_rate,
            interpolation,
            channels: vec![ChannelState::new(); num_channels],
            current_table_index: 0,
            current_row: 0,
            current_tick: 0,
            remaining_samples_in_tick: 0,
            tick_fraction_accum: 0,
            tempo: module.default_tempo.max(1),
            bpm: module.default_bpm.max(1),
            global_volume: 1.0,
            amplification: 0.25,
            pattern_loops,
            pattern_delay_counter: 0,
            row_transition: None,
            pending_triggers: vec![None; num_channels],
            loop_count: 0,
            max_loop_count: 0,
            generated_samples: 0,
            muted_instruments: vec![false; module.num_instruments() + 1],
            sample_trigger_times: core::iter::once(Vec::new())
                .chain(
                    module
                        .instruments
                        .iter()
                        .map(|inst| vec![0u64; inst.samples.len() + 1]),
                )
                .collect(),
        };
        // `remaining_samples_in_tick` starts at 0 so the very first frame
        // of `generate_samples` runs `perform_tick` and processes row 0,
        // tick 0 before any PCM is rendered (spec §4.E's outer protocol,
        // §8 property 5). Pre-computing it here instead would silently
        // skip tick 0's row for one full tick's worth of frames.
        player
    }

    /// Render `n` stereo frames into `out` (interleaved `[l0, r0, l1, r1,
    /// ...]`, length `2*n`). Deterministic, allocation-free, bounded work
    /// proportional to `num_channels` per frame (spec §5).
    pub fn generate_samples(&mut self, out: &mut [f32]) {
        debug_assert_eq!(out.len() % 2, 0);
        for frame in out.chunks_exact_mut(2) {
            if self.remaining_samples_in_tick == 0 {
                self.perform_tick();
            }
            let (l, r) = self.render_frame();
            frame[0] = l * self.global_volume * self.amplification;
            frame[1] = r * self.global_volume * self.amplification;
            self.remaining_samples_in_tick = self.remaining_samples_in_tick.saturating_sub(1);
            self.generated_samples += 1;
        }
    }

    fn render_frame(&mut self) -> (f32, f32) {
        let mut out = (0.0f32, 0.0f32);
        for ch_idx in 0..self.channels.len() {
            let instrument_muted = {
                let ch = &self.channels[ch_idx];
                ch.instrument != 0
                    && self
                        .muted_instruments
                        .get(ch.instrument as usize)
                        .copied()
                        .unwrap_or(false)
            };
            if instrument_muted {
                continue;
            }
            let Some(sample) = self.channel_sample(ch_idx) else {
                continue;
            };
            let ch = &mut self.channels[ch_idx];
            let (l, r) = render_channel(ch, sample, self.interpolation);
            out.0 += l;
            out.1 += r;
        }
        out
    }

    /// Borrow the current row's slots straight out of `self.module`, tied to
    /// `'m` rather than to `&self` — the same decoupled-borrow trick as
    /// [`Self::channel_sample`] — so callers can keep reading this slice
    /// across the `&mut self` dispatch calls that follow without a copy.
    fn current_row_slots(&self) -> Option<&'m [Slot]> {
        let pattern = self.module.pattern_at(self.current_table_index)?;
        if self.current_row >= pattern.rows {
            return None;
        }
        Some(pattern.row(self.current_row))
    }

    fn channel_sample(&self, ch_idx: usize) -> Option<&'m xm_ir::Sample<'a>> {
        let ch = &self.channels[ch_idx];
        if ch.instrument == 0 || ch.sample == 0 {
            return None;
        }
        self.module
            .instruments
            .get(ch.instrument as usize - 1)?
            .samples
            .get(ch.sample as usize - 1)
    }

    // ---- tick/row cursor -------------------------------------------------

    fn perform_tick(&mut self) {
        if self.current_tick == 0 {
            self.process_row();
        } else {
            self.process_tick_effects();
        }
        self.advance_envelopes();
        self.advance_tremor();

        self.current_tick += 1;
        if self.current_tick >= self.tempo {
            self.current_tick = 0;
            self.advance_cursor();
        }
        self.recompute_samples_per_tick();
    }

    fn advance_envelopes(&mut self) {
        for ch_idx in 0..self.channels.len() {
            let Some(instrument) = self.instrument_for_channel(ch_idx) else {
                continue;
            };
            let ch = &mut self.channels[ch_idx];
            let sustained = ch.sustained;
            let vol_value = ch.vol_env_cursor.advance(&instrument.volume_envelope, sustained);
            let pan_value = ch.pan_env_cursor.advance(&instrument.panning_envelope, sustained);
            ch.volume_envelope_volume = if instrument.volume_envelope.enabled {
                vol_value as f32 / 64.0
            } else {
                1.0
            };
            ch.panning_envelope_panning = if instrument.panning_envelope.enabled {
                pan_value as f32 / 64.0
            } else {
                0.5
            };

            if !sustained && instrument.volume_fadeout > 0 {
                let rate = instrument.volume_fadeout as f32 / 65536.0;
                ch.fadeout_volume = (ch.fadeout_volume - rate).max(0.0);
            }
        }
    }

    /// Recompute each channel's `Txx` tremor mute flag (spec §4.E). The
    /// cycle runs continuously from the tick the effect was last issued,
    /// not just on rows that repeat the effect column.
    fn advance_tremor(&mut self) {
        for ch in &mut self.channels {
            let cycle = ch.tremor_on as u16 + ch.tremor_off as u16;
            if cycle == 0 {
                ch.tremor_muted = false;
                continue;
            }
            ch.tremor_muted = (ch.tremor_counter % cycle) >= ch.tremor_on as u16;
            ch.tremor_counter = ch.tremor_counter.wrapping_add(1);
        }
    }

    fn instrument_for_channel(&self, ch_idx: usize) -> Option<&'m xm_ir::Instrument<'a>> {
        let instrument = self.channels[ch_idx].instrument;
        if instrument == 0 {
            return None;
        }
        self.module.instruments.get(instrument as usize - 1)
    }

    fn advance_cursor(&mut self) {
        if self.pattern_delay_counter > 0 {
            self.pattern_delay_counter -= 1;
            return;
        }

        let transition = self.row_transition.take().unwrap_or_default();
        self.pattern_delay_counter = transition.pattern_delay;

        if let Some(table_index) = transition.jump_table_index {
            self.jump_to_pattern_table_index(table_index);
            return;
        }
        // E6x pattern loop jumps back within the same pattern, unlike Dxx
        // pattern break which also steps the table index (spec §4.E, §8
        // property 7).
        if let Some(row) = transition.pattern_loop_row {
            self.current_row = row;
            return;
        }
        if let Some(row) = transition.break_row {
            self.step_table_index();
            self.current_row = row;
            return;
        }
        // EEx pattern delay replays the current row `pattern_delay` more
        // times before it is allowed to advance.
        if self.pattern_delay_counter > 0 {
            return;
        }

        let pattern_rows = self
            .module
            .pattern_at(self.current_table_index)
            .map(|p| p.rows)
            .unwrap_or(1);
        self.current_row += 1;
        if self.current_row >= pattern_rows {
            self.current_row = 0;
            self.step_table_index();
        }
    }

    fn step_table_index(&mut self) {
        self.current_table_index += 1;
        if self.current_table_index >= self.module.length {
            self.current_table_index = self.module.restart_position.min(self.module.length.saturating_sub(1));
            self.loop_count = self.loop_count.saturating_add(1);
        }
    }

    /// Implements the ambiguous `xm_player_jump` control surface as
    /// `seek(location, 0, 0)` (Open Questions resolved, DESIGN.md).
    pub fn jump_to_pattern_table_index(&mut self, table_index: u16) {
        self.current_table_index = table_index.min(self.module.length.saturating_sub(1));
        self.current_row = 0;
    }

    fn process_row(&mut self) {
        self.row_transition = None;
        let Some(row_slots) = self.current_row_slots() else {
            return;
        };
        let table_index = self.current_table_index as usize;
        let row = self.current_row;
        let num_slots = row_slots.len().min(self.channels.len());

        for ch_idx in 0..num_slots {
            let slot = row_slots[ch_idx];
            self.pending_triggers[ch_idx] = None;
            let effect = Effect::from_raw(slot.effect_type, slot.effect_param);
            // `EDx` (note delay) holds the whole slot's trigger back until
            // the given tick instead of acting on tick 0 (spec §4.E); it is
            // mutually exclusive with any other effect in this column.
            if let Effect::NoteDelay(delay) = effect {
                if delay > 0 {
                    self.pending_triggers[ch_idx] = Some(PendingTrigger { slot, tick: delay });
                    continue;
                }
            }
            self.trigger_slot(ch_idx, &slot, effect.is_tone_porta());
            self.dispatch_volume_column(ch_idx, VolumeColumn::from_raw(slot.volume_column), true);
            self.dispatch_effect(ch_idx, effect, true, table_index, row);
        }
    }

    /// Fire any `EDx`-deferred triggers whose tick has arrived (spec §4.E).
    fn fire_pending_triggers(&mut self) {
        for ch_idx in 0..self.pending_triggers.len() {
            let Some(pending) = self.pending_triggers[ch_idx] else {
                continue;
            };
            if pending.tick != self.current_tick {
                continue;
            }
            self.pending_triggers[ch_idx] = None;
            self.trigger_slot(ch_idx, &pending.slot, false);
            self.dispatch_volume_column(ch_idx, VolumeColumn::from_raw(pending.slot.volume_column), true);
        }
    }

    fn process_tick_effects(&mut self) {
        self.fire_pending_triggers();
        let Some(row_slots) = self.current_row_slots() else {
            return;
        };
        let table_index = self.current_table_index as usize;
        let row = self.current_row;
        let num_slots = row_slots.len().min(self.channels.len());

        for ch_idx in 0..num_slots {
            let slot = row_slots[ch_idx];
            self.dispatch_volume_column(ch_idx, VolumeColumn::from_raw(slot.volume_column), false);
            self.dispatch_effect(ch_idx, Effect::from_raw(slot.effect_type, slot.effect_param), false, table_index, row);
        }
    }

    /// Volume-column commands (spec §3/§4.E): set-volume/set-panning/set-
    /// vibrato-speed act once on tick 0; slides and the vibrato/tone-porta
    /// shorthands act on every later tick, same as their effect-column
    /// counterparts.
    fn dispatch_volume_column(&mut self, ch_idx: usize, vc: VolumeColumn, tick_zero: bool) {
        match vc {
            VolumeColumn::None => {}
            VolumeColumn::SetVolume(v) => {
                if tick_zero {
                    self.channels[ch_idx].volume = v as f32 / 64.0;
                }
            }
            VolumeColumn::SetPanning(p) => {
                if tick_zero {
                    self.channels[ch_idx].panning = p as f32 / 15.0;
                }
            }
            VolumeColumn::SetVibratoSpeed(speed) => {
                if tick_zero {
                    self.channels[ch_idx].vibrato.rate = speed;
                }
            }
            VolumeColumn::FineVolumeSlideDown(amount) => {
                if tick_zero {
                    self.channels[ch_idx].volume = (self.channels[ch_idx].volume - amount as f32 / 64.0).max(0.0);
                }
            }
            VolumeColumn::FineVolumeSlideUp(amount) => {
                if tick_zero {
                    self.channels[ch_idx].volume = (self.channels[ch_idx].volume + amount as f32 / 64.0).min(1.0);
                }
            }
            VolumeColumn::VolumeSlideDown(amount) => {
                if !tick_zero {
                    self.channels[ch_idx].volume = (self.channels[ch_idx].volume - amount as f32 / 64.0).max(0.0);
                }
            }
            VolumeColumn::VolumeSlideUp(amount) => {
                if !tick_zero {
                    self.channels[ch_idx].volume = (self.channels[ch_idx].volume + amount as f32 / 64.0).min(1.0);
                }
            }
            VolumeColumn::Vibrato(depth) => {
                if !tick_zero {
                    self.vibrato(ch_idx, 0, depth);
                }
            }
            VolumeColumn::PanningSlideLeft(amount) => {
                if !tick_zero {
                    self.channels[ch_idx].panning = (self.channels[ch_idx].panning - amount as f32 / 15.0).max(0.0);
                }
            }
            VolumeColumn::PanningSlideRight(amount) => {
                if !tick_zero {
                    self.channels[ch_idx].panning = (self.channels[ch_idx].panning + amount as f32 / 15.0).min(1.0);
                }
            }
            VolumeColumn::TonePorta(speed) => {
                if !tick_zero {
                    self.tone_porta(ch_idx, speed * 16);
                }
            }
        }
    }

    // ---- note triggering ---------------------------------------------------

    fn trigger_slot(&mut self, ch_idx: usize, slot: &Slot, is_tone_porta: bool) {
        if slot.instrument != 0 {
            self.channels[ch_idx].instrument = slot.instrument;
        }

        // Volume-column dispatch (including `SetVolume`) happens separately
        // in `dispatch_volume_column`, called right after this from
        // `process_row`.

        if slot.is_key_off() {
            self.channels[ch_idx].key_off();
            return;
        }

        if !slot.has_note() {
            if slot.instrument != 0 {
                self.reread_instrument(ch_idx);
            }
            return;
        }

        if is_tone_porta {
            self.set_tone_porta_target(ch_idx, slot.note);
        } else {
            self.trigger_note(ch_idx, slot.note);
        }
    }

    /// `3xx`/`5xx` on a row with a note: retarget the glide instead of
    /// retriggering the sample (spec §4.E). Falls back to a normal trigger
    /// if the channel has nothing currently sounding to glide from.
    fn set_tone_porta_target(&mut self, ch_idx: usize, note: u8) {
        if note == 0 {
            return;
        }
        let note0 = note - 1;
        let Some(sample) = self.channel_sample(ch_idx) else {
            self.trigger_note(ch_idx, note);
            return;
        };
        let target_period = note_to_period(note0 as i32 + sample.relative_note as i32, sample.finetune);
        let ch = &mut self.channels[ch_idx];
        ch.tone_porta_target_period = target_period;
        ch.note = note;
    }

    /// "Instrument alone" row (spec §4.E): re-read volume/panning/envelopes
    /// from the instrument's currently-sounding sample without retriggering
    /// playback.
    fn reread_instrument(&mut self, ch_idx: usize) {
        let sample = self.channel_sample(ch_idx).map(|s| (s.volume, s.panning));
        let ch = &mut self.channels[ch_idx];
        if let Some((volume, panning)) = sample {
            ch.volume = volume;
            ch.panning = panning;
        }
        ch.vol_env_cursor.reset();
        ch.pan_env_cursor.reset();
    }

    fn trigger_note(&mut self, ch_idx: usize, note: u8) {
        let instrument_idx = self.channels[ch_idx].instrument;
        if instrument_idx == 0 {
            return;
        }
        let Some(instrument) = self.module.instruments.get(instrument_idx as usize - 1) else {
            return;
        };
        if note == 0 {
            return;
        }
        let note0 = note - 1;
        let Some(sample_idx) = instrument.sample_index_for_note(note0) else {
            return;
        };
        let Some(sample) = instrument.samples.get(sample_idx) else {
            return;
        };

        let finetune = sample.finetune;
        let relative_note = sample.relative_note;
        let frequency_type = self.module.frequency_type;
        let sample_rate = self.sample_rate;
        let sample_volume = sample.volume;
        let sample_panning = sample.panning;

        let ch = &mut self.channels[ch_idx];
        ch.sample = (sample_idx + 1) as u8;
        ch.note = note;
        ch.orig_note = note;
        ch.period = note_to_period(note0 as i32 + relative_note as i32, finetune);
        ch.frequency = period_to_frequency(ch.period, frequency_type);
        ch.step = frequency_to_step(ch.frequency, sample_rate);
        ch.sample_position = (ch.sample_offset_memory as i64) << 16;
        ch.active = true;
        ch.ping = true;
        ch.sustained = true;
        ch.fadeout_volume = 1.0;
        ch.volume = sample_volume;
        ch.panning = sample_panning;
        ch.vol_env_cursor.reset();
        ch.pan_env_cursor.reset();
        ch.volume_envelope_volume = 1.0;
        ch.panning_envelope_panning = 0.5;
        ch.tremor_counter = 0;
        ch.tremor_muted = false;
        ch.latest_trigger = self.generated_samples;

        if let Some(slot) = self
            .sample_trigger_times
            .get_mut(instrument_idx as usize)
            .and_then(|samples| samples.get_mut(sample_idx + 1))
        {
            *slot = self.generated_samples;
        }
    }

    // ---- effect dispatch ---------------------------------------------------

    fn dispatch_effect(
        &mut self,
        ch_idx: usize,
        effect: Effect,
        tick_zero: bool,
        table_index: usize,
        row: u16,
    ) {
        let tick_effect_on_tick_zero = effect.is_row_effect();
        if tick_effect_on_tick_zero != tick_zero {
            return;
        }

        match effect {
            Effect::None => {}
            Effect::Arpeggio { x, y } => self.arpeggio(ch_idx, x, y),
            Effect::PortaUp(param) => self.porta_up(ch_idx, param, false),
            Effect::PortaDown(param) => self.porta_down(ch_idx, param, false),
            Effect::TonePorta(param) => self.tone_porta(ch_idx, param),
            Effect::Vibrato { speed, depth } => self.vibrato(ch_idx, speed, depth),
            Effect::TonePortaVolSlide(param) => {
                self.tone_porta(ch_idx, 0);
                self.volume_slide(ch_idx, param);
            }
            Effect::VibratoVolSlide(param) => {
                self.vibrato(ch_idx, 0, 0);
                self.volume_slide(ch_idx, param);
            }
            Effect::Tremolo { speed, depth } => self.tremolo(ch_idx, speed, depth),
            Effect::SetPanning(param) => {
                self.channels[ch_idx].panning = param as f32 / 255.0;
            }
            Effect::SampleOffset(param) => {
                let offset = (param as u32) << 8;
                self.channels[ch_idx].sample_offset_memory = offset;
                self.channels[ch_idx].sample_position = (offset as i64) << 16;
            }
            Effect::VolumeSlide(param) => self.volume_slide(ch_idx, param),
            Effect::PositionJump(param) => {
                self.set_row_transition(|t| t.jump_table_index = Some(param as u16));
            }
            Effect::SetVolume(param) => {
                self.channels[ch_idx].volume = param as f32 / 64.0;
            }
            Effect::PatternBreak(row_arg) => {
                self.set_row_transition(|t| t.break_row = Some(row_arg as u16));
            }
            Effect::FinePortaUp(param) => self.porta_up(ch_idx, param, true),
            Effect::FinePortaDown(param) => self.porta_down(ch_idx, param, true),
            Effect::SetGlissando(_) => {}
            Effect::SetVibratoWaveform(param) => {
                self.channels[ch_idx].vibrato.waveform = xm_ir::Waveform::from_raw(param);
            }
            Effect::SetFinetune(_) => {}
            Effect::PatternLoop(param) => self.pattern_loop(ch_idx, param, table_index, row),
            Effect::SetTremoloWaveform(param) => {
                self.channels[ch_idx].tremolo.waveform = xm_ir::Waveform::from_raw(param);
            }
            Effect::SetPanPosition(param) => {
                self.channels[ch_idx].panning = param as f32 / 15.0;
            }
            Effect::RetriggerNote(param) => {
                if param > 0 && (self.current_tick % param) == 0 {
                    self.retrigger_sample(ch_idx);
                }
            }
            Effect::FineVolumeSlideUp(param) => self.volume_slide(ch_idx, param << 4),
            Effect::FineVolumeSlideDown(param) => self.volume_slide(ch_idx, param),
            Effect::NoteCut(param) => {
                if self.current_tick == param {
                    self.channels[ch_idx].cut();
                }
            }
            // Handled up front in `process_row`/`fire_pending_triggers`:
            // a delayed slot's whole trigger (not just this marker) is
            // held back until its tick.
            Effect::NoteDelay(_) => {}
            Effect::PatternDelay(param) => {
                self.set_row_transition(|t| t.pattern_delay = param);
            }
            Effect::SetTempo(param) => {
                if param > 0 {
                    self.tempo = param;
                }
            }
            Effect::SetBpm(param) => {
                if param > 0 {
                    self.bpm = param;
                }
            }
            Effect::SetGlobalVolume(param) => {
                self.global_volume = param as f32 / 64.0;
            }
            Effect::GlobalVolumeSlide(param) => {
                let up = (param >> 4) & 0x0F;
                let down = param & 0x0F;
                if up > 0 {
                    self.global_volume = (self.global_volume + up as f32 / 64.0).min(1.0);
                } else if down > 0 {
                    self.global_volume = (self.global_volume - down as f32 / 64.0).max(0.0);
                }
            }
            Effect::KeyOff(param) => {
                if self.current_tick == param {
                    self.channels[ch_idx].key_off();
                }
            }
            Effect::SetEnvelopePosition(param) => {
                self.channels[ch_idx].vol_env_cursor.set_frame(param as u16);
                self.channels[ch_idx].pan_env_cursor.set_frame(param as u16);
            }
            Effect::PanningSlide(param) => self.panning_slide(ch_idx, param),
            Effect::MultiRetrig { interval, volume_change } => {
                if interval > 0 {
                    self.channels[ch_idx].multi_retrig_memory.0 = interval;
                }
                if volume_change > 0 {
                    self.channels[ch_idx].multi_retrig_memory.1 = volume_change;
                }
                let (effective_interval, vol_change) = self.channels[ch_idx].multi_retrig_memory;
                if effective_interval > 0 && (self.current_tick % effective_interval) == 0 {
                    let new_volume =
                        apply_retrig_volume_change(self.channels[ch_idx].volume, vol_change);
                    self.channels[ch_idx].volume = new_volume;
                    self.retrigger_sample(ch_idx);
                }
            }
            Effect::Tremor { on, off } => {
                let ch = &mut self.channels[ch_idx];
                if on > 0 {
                    ch.tremor_on = on;
                }
                if off > 0 {
                    ch.tremor_off = off;
                }
            }
            Effect::ExtraFinePortaUp(param) => self.porta_up(ch_idx, param, true),
            Effect::ExtraFinePortaDown(param) => self.porta_down(ch_idx, param, true),
        }
    }

    fn set_row_transition(&mut self, f: impl FnOnce(&mut RowTransition)) {
        let mut t = self.row_transition.unwrap_or_default();
        f(&mut t);
        self.row_transition = Some(t);
    }

    fn arpeggio(&mut self, ch_idx: usize, x: u8, y: u8) {
        let offset = match self.current_tick % 3 {
            1 => x as i32,
            2 => y as i32,
            _ => 0,
        };
        let ch = &mut self.channels[ch_idx];
        let period = ch.period - offset * 64;
        ch.frequency = period_to_frequency(period, self.module.frequency_type);
        ch.step = frequency_to_step(ch.frequency, self.sample_rate);
    }

    fn porta_up(&mut self, ch_idx: usize, param: u8, once: bool) {
        let ch = &mut self.channels[ch_idx];
        let amount = if param > 0 {
            ch.porta_up_memory = param;
            param
        } else {
            ch.porta_up_memory
        };
        if once || self.current_tick > 0 {
            ch.period = (ch.period - amount as i32 * 4).max(1);
            ch.frequency = period_to_frequency(ch.period, self.module.frequency_type);
            ch.step = frequency_to_step(ch.frequency, self.sample_rate);
        }
    }

    fn porta_down(&mut self, ch_idx: usize, param: u8, once: bool) {
        let ch = &mut self.channels[ch_idx];
        let amount = if param > 0 {
            ch.porta_down_memory = param;
            param
        } else {
            ch.porta_down_memory
        };
        if once || self.current_tick > 0 {
            ch.period += amount as i32 * 4;
            ch.frequency = period_to_frequency(ch.period, self.module.frequency_type);
            ch.step = frequency_to_step(ch.frequency, self.sample_rate);
        }
    }

    fn tone_porta(&mut self, ch_idx: usize, param: u8) {
        let ch = &mut self.channels[ch_idx];
        if param > 0 {
            ch.tone_porta_speed = param;
        }
        if self.current_tick == 0 && param == 0 {
            return;
        }
        let speed = ch.tone_porta_speed as i32 * 4;
        let target = ch.tone_porta_target_period;
        if ch.period < target {
            ch.period = (ch.period + speed).min(target);
        } else if ch.period > target {
            ch.period = (ch.period - speed).max(target);
        }
        ch.frequency = period_to_frequency(ch.period, self.module.frequency_type);
        ch.step = frequency_to_step(ch.frequency, self.sample_rate);
    }

    fn vibrato(&mut self, ch_idx: usize, speed: u8, depth: u8) {
        let ch = &mut self.channels[ch_idx];
        if speed > 0 {
            ch.vibrato.rate = speed;
        }
        if depth > 0 {
            ch.vibrato.depth = depth;
        }
        let offset = lfo_value(ch.vibrato.waveform, ch.vibrato.offset) * ch.vibrato.depth as i32 / 16;
        ch.vibrato.offset = ch.vibrato.offset.wrapping_add(ch.vibrato.rate);
        let period = ch.period + offset;
        ch.frequency = period_to_frequency(period, self.module.frequency_type);
        ch.step = frequency_to_step(ch.frequency, self.sample_rate);
    }

    fn tremolo(&mut self, ch_idx: usize, speed: u8, depth: u8) {
        let ch = &mut self.channels[ch_idx];
        if speed > 0 {
            ch.tremolo.rate = speed;
        }
        if depth > 0 {
            ch.tremolo.depth = depth;
        }
        let offset = lfo_value(ch.tremolo.waveform, ch.tremolo.offset) * ch.tremolo.depth as i32;
        ch.tremolo.offset = ch.tremolo.offset.wrapping_add(ch.tremolo.rate);
        ch.volume = (ch.volume + offset as f32 / 4096.0).clamp(0.0, 1.0);
    }

    fn volume_slide(&mut self, ch_idx: usize, param: u8) {
        let ch = &mut self.channels[ch_idx];
        let amount = if param > 0 {
            ch.volume_slide_memory = param;
            param
        } else {
            ch.volume_slide_memory
        };
        let up = (amount >> 4) & 0x0F;
        let down = amount & 0x0F;
        if up > 0 {
            ch.volume = (ch.volume + up as f32 / 64.0).min(1.0);
        } else if down > 0 {
            ch.volume = (ch.volume - down as f32 / 64.0).max(0.0);
        }
    }

    fn panning_slide(&mut self, ch_idx: usize, param: u8) {
        let ch = &mut self.channels[ch_idx];
        let amount = if param > 0 {
            ch.panning_slide_memory = param;
            param
        } else {
            ch.panning_slide_memory
        };
        let up = (amount >> 4) & 0x0F;
        let down = amount & 0x0F;
        if up > 0 {
            ch.panning = (ch.panning + up as f32 / 255.0).min(1.0);
        } else if down > 0 {
            ch.panning = (ch.panning - down as f32 / 255.0).max(0.0);
        }
    }

    /// Restart sample playback from the sample-offset memory without
    /// re-resolving note/instrument (spec §4.E `E9x`/`Rxx`).
    fn retrigger_sample(&mut self, ch_idx: usize) {
        let ch = &mut self.channels[ch_idx];
        ch.sample_position = (ch.sample_offset_memory as i64) << 16;
        ch.ping = true;
        ch.active = true;
    }

    fn pattern_loop(&mut self, ch_idx: usize, param: u8, table_index: usize, row: u16) {
        let Some(loops) = self.pattern_loops.get_mut(table_index) else {
            return;
        };
        let Some(entry) = loops.get_mut(ch_idx) else {
            return;
        };
        if param == 0 {
            entry.start_row = row;
            entry.count = 0;
            return;
        }
        if entry.count < param {
            entry.count += 1;
            let start = entry.start_row;
            self.set_row_transition(|t| t.pattern_loop_row = Some(start));
        } else {
            entry.count = 0;
        }
    }

    fn recompute_samples_per_tick(&mut self) {
        // samples_per_tick = rate * 2.5 / bpm, tracked as a fixed-point
        // accumulator so rounding error does not drift the average tempo
        // over a long playback (spec §4.E).
        let numerator = self.sample_rate as u64 * 5 * 256;
        let denominator = self.bpm.max(1) as u64 * 2;
        let scaled = numerator / denominator;
        let whole = scaled / 256;
        let frac = (scaled % 256) as u32;
        self.tick_fraction_accum += frac;
        let carry = self.tick_fraction_accum / 256;
        self.tick_fraction_accum %= 256;
        self.remaining_samples_in_tick = whole as u32 + carry as u32;
    }

    // ---- query surface (spec §4.G) -----------------------------------------

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_patterns(&self) -> usize {
        self.module.num_patterns()
    }

    pub fn num_instruments(&self) -> usize {
        self.module.num_instruments()
    }

    pub fn num_samples(&self, instrument: usize) -> usize {
        self.module
            .instruments
            .get(instrument.wrapping_sub(1))
            .map(|i| i.samples.len())
            .unwrap_or(0)
    }

    pub fn num_rows(&self) -> usize {
        self.module
            .pattern_at(self.current_table_index)
            .map(|p| p.rows as usize)
            .unwrap_or(0)
    }

    pub fn current_table_index(&self) -> u16 {
        self.current_table_index
    }

    pub fn current_pattern_number(&self) -> Option<usize> {
        self.module
            .pattern_table
            .get(self.current_table_index as usize)
            .map(|&p| p as usize)
    }

    pub fn current_row(&self) -> u16 {
        self.current_row
    }

    pub fn generated_samples(&self) -> u64 {
        self.generated_samples
    }

    pub fn tempo(&self) -> u8 {
        self.tempo
    }

    pub fn bpm(&self) -> u8 {
        self.bpm
    }

    /// 1-indexed, per spec §4.G and the control-surface convention (§6).
    pub fn channel_frequency(&self, channel: usize) -> f64 {
        self.channels
            .get(channel.wrapping_sub(1))
            .map(|c| c.frequency)
            .unwrap_or(0.0)
    }

    pub fn channel_volume(&self, channel: usize) -> f32 {
        self.channels
            .get(channel.wrapping_sub(1))
            .map(|c| c.volume)
            .unwrap_or(0.0)
    }

    pub fn channel_panning(&self, channel: usize) -> f32 {
        self.channels
            .get(channel.wrapping_sub(1))
            .map(|c| c.panning)
            .unwrap_or(0.5)
    }

    pub fn channel_active(&self, channel: usize) -> bool {
        self.channels
            .get(channel.wrapping_sub(1))
            .map(|c| c.is_active())
            .unwrap_or(false)
    }

    pub fn channel_instrument(&self, channel: usize) -> u8 {
        self.channels
            .get(channel.wrapping_sub(1))
            .map(|c| c.instrument)
            .unwrap_or(0)
    }

    /// 1-indexed, matching `mute_instrument`/`mute_channel`. Reads the live
    /// side table `trigger_note` writes to, since `Instrument`/`Sample`
    /// themselves are borrowed from an immutable `&Module` and never
    /// updated during playback.
    pub fn latest_trigger(&self, instrument: usize, sample: usize) -> u64 {
        self.sample_trigger_times
            .get(instrument)
            .and_then(|samples| samples.get(sample))
            .copied()
            .unwrap_or(0)
    }

    pub fn loop_count(&self) -> u8 {
        self.loop_count
    }

    pub fn set_max_loop_count(&mut self, count: u8) {
        self.max_loop_count = count;
    }

    pub fn max_loop_count(&self) -> u8 {
        self.max_loop_count
    }

    pub fn should_stop(&self) -> bool {
        self.max_loop_count > 0 && self.loop_count >= self.max_loop_count
    }

    /// 1-indexed. Returns the previous mute state.
    pub fn mute_channel(&mut self, channel: usize, muted: bool) -> bool {
        match self.channels.get_mut(channel.wrapping_sub(1)) {
            Some(ch) => core::mem::replace(&mut ch.muted, muted),
            None => false,
        }
    }

    /// 1-indexed. Returns the previous mute state.
    pub fn mute_instrument(&mut self, instrument: usize, muted: bool) -> bool {
        match self.muted_instruments.get_mut(instrument) {
            Some(slot) => core::mem::replace(slot, muted),
            None => false,
        }
    }

    /// Repositions playback without resetting channel/effect state, per
    /// spec §6's `seek(ctx, table_index, row, tick)`.
    pub fn seek(&mut self, table_index: u16, row: u16, tick: u8) {
        self.current_table_index = table_index.min(self.module.length.saturating_sub(1));
        self.current_row = row;
        self.current_tick = tick;
        self.remaining_samples_in_tick = 0;
    }
}

/// FT2's `Rxx` multi-retrig volume-change table (spec §4.E): the high
/// nibble of the effect param selects how the channel volume is nudged
/// each time the note retriggers.
fn apply_retrig_volume_change(volume: f32, code: u8) -> f32 {
    let result = match code {
        0x1 => volume - 1.0 / 64.0,
        0x2 => volume - 2.0 / 64.0,
        0x3 => volume - 4.0 / 64.0,
        0x4 => volume - 8.0 / 64.0,
        0x5 => volume - 16.0 / 64.0,
        0x6 => volume * 2.0 / 3.0,
        0x7 => volume * 0.5,
        0x9 => volume + 1.0 / 64.0,
        0xA => volume + 2.0 / 64.0,
        0xB => volume + 4.0 / 64.0,
        0xC => volume + 8.0 / 64.0,
        0xD => volume + 16.0 / 64.0,
        0xE => volume * 1.5,
        0xF => volume * 2.0,
        _ => volume,
    };
    result.clamp(0.0, 1.0)
}

/// Evaluate one of the four FT2 vibrato/tremolo waveforms at `phase`
/// (0..255, wrapping), returning an offset in `-64..=64` (spec §4.E).
fn lfo_value(waveform: xm_ir::Waveform, phase: u8) -> i32 {
    use xm_ir::Waveform;
    match waveform {
        Waveform::Sine => {
            let radians = phase as f64 * core::f64::consts::PI / 128.0;
            (libm::sin(radians) * 64.0) as i32
        }
        Waveform::Square => {
            if phase < 128 {
                64
            } else {
                -64
            }
        }
        Waveform::RampDown => 64 - (phase as i32 * 128 / 255),
        Waveform::RampUp => (phase as i32 * 128 / 255) - 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::borrow::Cow;
    use arrayvec::ArrayString;
    use xm_ir::{FrequencyType, Instrument, LoopType, Pattern, Sample, SampleBytes};

    fn one_note_module() -> Module<'static> {
        let mut pattern = Pattern::new(4, 1);
        pattern.slot_mut(0, 0).note = 49; // C-4
        pattern.slot_mut(0, 0).instrument = 1;

        let mut sample = Sample::default();
        sample.data = SampleBytes::owned(alloc::vec![0u8; 1000]);
        sample.loop_type = LoopType::Forward;
        sample.loop_start = 0;
        sample.loop_end = 1000;

        let mut instrument = Instrument::new("lead");
        instrument.sample_of_note = [0; 96];
        instrument.samples.push(sample);

        Module {
            name: ArrayString::new(),
            tracker_name: ArrayString::new(),
            restart_position: 0,
            length: 1,
            pattern_table: Cow::Owned(alloc::vec![0]),
            frequency_type: FrequencyType::Linear,
            num_channels: 1,
            default_tempo: 6,
            default_bpm: 125,
            patterns: alloc::vec![pattern],
            instruments: alloc::vec![instrument],
        }
    }

    #[test]
    fn new_player_starts_at_origin() {
        let module = one_note_module();
        let player = Player::new(&module, 44100);
        assert_eq!(player.current_table_index(), 0);
        assert_eq!(player.current_row(), 0);
        assert_eq!(player.loop_count(), 0);
        assert_eq!(player.global_volume, 1.0);
        assert_eq!(player.amplification, 0.25);
    }

    #[test]
    fn generate_samples_triggers_note_and_advances_position() {
        let module = one_note_module();
        let mut player = Player::new(&module, 44100);
        let mut buf = [0.0f32; 4096 * 2];
        player.generate_samples(&mut buf);
        assert!(player.channel_active(1));
        assert!(player.channel_frequency(1) > 0.0);
    }

    #[test]
    fn mute_channel_silences_output() {
        let module = one_note_module();
        let mut player = Player::new(&module, 44100);
        let prev = player.mute_channel(1, true);
        assert!(!prev);
        let mut buf = [1.0f32; 512];
        player.generate_samples(&mut buf);
        assert!(buf.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn restart_position_wraps_and_increments_loop_count() {
        let module = one_note_module();
        let mut player = Player::new(&module, 44100);
        let mut buf = [0.0f32; 8192 * 2];
        for _ in 0..20 {
            player.generate_samples(&mut buf);
        }
        assert!(player.loop_count() >= 1);
    }

    #[test]
    fn seek_repositions_cursor() {
        let module = one_note_module();
        let mut player = Player::new(&module, 44100);
        player.seek(0, 2, 0);
        assert_eq!(player.current_row(), 2);
    }

    #[test]
    fn max_loop_count_stop_signal() {
        let module = one_note_module();
        let mut player = Player::new(&module, 44100);
        player.set_max_loop_count(1);
        assert!(!player.should_stop());
        let mut buf = [0.0f32; 8192 * 2];
        for _ in 0..20 {
            player.generate_samples(&mut buf);
        }
        assert!(player.should_stop());
    }

    /// `EDx` (spec §4.E): a note on tick 0 with a nonzero note-delay param
    /// does not sound until the delayed tick arrives.
    #[test]
    fn note_delay_defers_trigger_to_its_tick() {
        let mut module = one_note_module();
        module.patterns[0].slot_mut(0, 0).effect_type = 14; // Exx
        module.patterns[0].slot_mut(0, 0).effect_param = 0xD3; // EDx, delay to tick 3

        let mut player = Player::new(&module, 44100);
        // First frame runs `perform_tick` for tick 0 before rendering
        // anything: the delayed note must not have triggered yet.
        let mut one_frame = [0.0f32; 2];
        player.generate_samples(&mut one_frame);
        assert!(!player.channel_active(1), "note should not sound before its delayed tick");

        // A generous buffer comfortably covers several ticks at any bpm.
        let mut buf = [0.0f32; 20_000 * 2];
        player.generate_samples(&mut buf);
        assert!(player.channel_active(1), "note should sound once its delayed tick arrives");
    }

    /// `E9x` (spec §4.E): retriggers the sounding note every `x` ticks.
    #[test]
    fn retrigger_note_keeps_channel_active() {
        let mut module = one_note_module();
        module.patterns[0].slot_mut(0, 0).effect_type = 14; // Exx
        module.patterns[0].slot_mut(0, 0).effect_param = 0x92; // E9x, retrigger every 2 ticks

        let mut player = Player::new(&module, 44100);
        let mut buf = [0.0f32; 20_000 * 2];
        player.generate_samples(&mut buf);
        assert!(player.channel_active(1));
    }

    /// `Txx` tremor (spec §4.E): the "off" half of the cycle silences the
    /// channel's contribution to the mix.
    #[test]
    fn tremor_mutes_channel_during_off_phase() {
        let mut module = one_note_module();
        module.patterns[0].slot_mut(0, 0).effect_type = 29; // Txx
        module.patterns[0].slot_mut(0, 0).effect_param = 0x22; // on=2, off=2

        let mut player = Player::new(&module, 44100);
        let mut saw_silence = false;
        for _ in 0..40 {
            let mut buf = [0.0f32; 512];
            player.generate_samples(&mut buf);
            if buf.iter().all(|&s| s == 0.0) {
                saw_silence = true;
            }
        }
        assert!(saw_silence, "tremor off-phase should silence the channel's output");
    }
}
