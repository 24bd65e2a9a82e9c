//! Per-channel playback state (spec §3 "Channel state").

use xm_ir::Waveform;

use crate::envelope_cursor::EnvelopeCursor;

/// Oscillator waveform for vibrato/tremolo effects (distinct instance per
/// channel from an instrument's auto-vibrato, since the channel's effect
/// column can override the waveform independently).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Lfo {
    pub waveform: Waveform,
    pub offset: u8,
    pub depth: u8,
    pub rate: u8,
    pub retrigger: bool,
}

/// Mutable state for one of the module's channels.
#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    /// 1-based instrument index, 0 = none.
    pub instrument: u8,
    /// 1-based sample index (within the instrument), 0 = none.
    pub sample: u8,
    pub note: u8,
    pub orig_note: u8,

    pub period: i32,
    pub frequency: f64,
    /// 16.16 fixed-point per-frame sample-position step.
    pub step: u32,
    /// Fixed-point (16.16) position into the active sample. Silence is
    /// tracked separately via `active`, not by the sign of this field.
    pub sample_position: i64,
    pub active: bool,
    /// Forward direction flag for ping-pong looping.
    pub ping: bool,

    pub porta_up_memory: u8,
    pub porta_down_memory: u8,
    pub tone_porta_speed: u8,
    pub tone_porta_target_period: i32,
    pub vibrato: Lfo,
    pub tremolo: Lfo,
    pub tremor_on: u8,
    pub tremor_off: u8,
    /// Ticks elapsed since this channel's tremor cycle started; counts
    /// across rows so a `Txx` issued once keeps muting on schedule even on
    /// rows where the effect column is empty.
    pub tremor_counter: u16,
    pub tremor_muted: bool,
    pub volume_slide_memory: u8,
    pub panning_slide_memory: u8,
    pub multi_retrig_memory: (u8, u8),
    pub sample_offset_memory: u32,

    pub vol_env_cursor: EnvelopeCursor,
    pub pan_env_cursor: EnvelopeCursor,
    pub sustained: bool,
    /// Decays toward 0 after key-off.
    pub fadeout_volume: f32,
    pub volume_envelope_volume: f32,
    pub panning_envelope_panning: f32,

    /// Channel's own volume, 0.0..1.0.
    pub volume: f32,
    /// Channel's own panning, 0.0 (left) .. 1.0 (right).
    pub panning: f32,
    pub actual_volume_left: f32,
    pub actual_volume_right: f32,
    pub previous_volume_left: f32,
    pub previous_volume_right: f32,

    pub muted: bool,
    pub latest_trigger: u64,
}

impl ChannelState {
    /// Initial state for a freshly created playback context, matching the
    /// original `xm_create_context_safe` reset values exactly (SPEC_FULL
    /// §10): every channel starts `ping = true`, sine waveforms retrigger
    /// by default, volume/fadeout/envelope volumes start at 1.0, panning at
    /// 0.5 (center), and `actual_volume` starts at 0.0 so the very first
    /// note ramps in from silence.
    pub fn new() -> Self {
        Self {
            ping: true,
            vibrato: Lfo {
                waveform: Waveform::Sine,
                retrigger: true,
                ..Lfo::default()
            },
            tremolo: Lfo {
                waveform: Waveform::Sine,
                retrigger: true,
                ..Lfo::default()
            },
            volume: 1.0,
            fadeout_volume: 1.0,
            volume_envelope_volume: 1.0,
            panning: 0.5,
            panning_envelope_panning: 0.5,
            actual_volume_left: 0.0,
            actual_volume_right: 0.0,
            ..Default::default()
        }
    }

    /// Stop sample playback; effect memories and panning survive.
    pub fn cut(&mut self) {
        self.active = false;
        self.sample_position = 0;
    }

    /// Mark the channel as receiving a key-off: fadeout begins ticking.
    pub fn key_off(&mut self) {
        self.sustained = false;
    }

    pub fn is_active(&self) -> bool {
        self.active && self.instrument != 0 && self.sample != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_channel_matches_documented_reset_values() {
        let ch = ChannelState::new();
        assert!(ch.ping);
        assert_eq!(ch.vibrato.waveform, Waveform::Sine);
        assert!(ch.vibrato.retrigger);
        assert_eq!(ch.volume, 1.0);
        assert_eq!(ch.fadeout_volume, 1.0);
        assert_eq!(ch.panning, 0.5);
        assert_eq!(ch.actual_volume_left, 0.0);
    }

    #[test]
    fn is_active_requires_instrument_sample_and_flag() {
        let mut ch = ChannelState::new();
        assert!(!ch.is_active());
        ch.instrument = 1;
        ch.sample = 1;
        assert!(!ch.is_active());
        ch.active = true;
        assert!(ch.is_active());
    }

    #[test]
    fn cut_clears_active_and_position() {
        let mut ch = ChannelState::new();
        ch.active = true;
        ch.sample_position = 1234;
        ch.cut();
        assert!(!ch.active);
        assert_eq!(ch.sample_position, 0);
    }
}
