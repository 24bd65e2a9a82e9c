//! Per-frame oscillator and stereo mixdown (spec component F, §4.F).
//!
//! [`render_channel`] is the inner loop: one call renders exactly one
//! channel's contribution to one output frame — interpolated PCM lookup,
//! volume/panning ramp, loop wraparound. It performs no allocation and
//! never panics regardless of sample/loop state, which is what makes
//! [`crate::player::Player::generate_samples`] safe to call from an
//! interrupt context (spec §5).

use xm_ir::{LoopType, Sample};

use crate::channel::ChannelState;

/// How to reconstruct a value between two stored PCM frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    Nearest,
}

/// Volume/panning ramps move at most this much per rendered frame, so a
/// full-scale jump takes exactly 128 frames (spec §4.F step 3, Design
/// Notes §9, grounded on `context.c`'s `volume_ramp = 1.f / 128.f`).
pub const RAMP_STEP: f32 = 1.0 / 128.0;

/// Render one channel's contribution to the current output frame as
/// `(left, right)` in `[-1, 1]`-ish range (un-clipped; the caller applies
/// global volume/amplification once over the full mix). Advances the
/// channel's oscillator position and volume/pan ramps by exactly one
/// frame. Returns `(0.0, 0.0)` and does nothing else for an inactive or
/// muted channel.
pub fn render_channel(
    ch: &mut ChannelState,
    sample: &Sample,
    interpolation: Interpolation,
) -> (f32, f32) {
    if !ch.is_active() || ch.muted {
        return (0.0, 0.0);
    }
    if sample.is_empty() {
        ch.active = false;
        return (0.0, 0.0);
    }

    let whole = (ch.sample_position >> 16).clamp(0, sample.len_frames() as i64 - 1);
    let frac = (ch.sample_position & 0xFFFF) as f32 / 65536.0;

    let s0 = sample.frame_i16(whole as usize);
    let signal = match interpolation {
        Interpolation::Nearest => s0 as f32,
        Interpolation::Linear => {
            let s1 = neighbor_frame(ch, sample, whole);
            s0 as f32 + (s1 as f32 - s0 as f32) * frac
        }
    } / 32768.0;

    let (target_left, target_right) = target_gains(ch);
    ramp_toward(&mut ch.actual_volume_left, target_left);
    ramp_toward(&mut ch.actual_volume_right, target_right);

    let out = (signal * ch.actual_volume_left, signal * ch.actual_volume_right);
    advance_position(ch, sample);
    out
}

fn ramp_toward(current: &mut f32, target: f32) {
    let delta = target - *current;
    if delta.abs() <= RAMP_STEP {
        *current = target;
    } else {
        *current += RAMP_STEP.copysign(delta);
    }
}

/// Per-channel gain before the master `global_volume * amplification` pass
/// (applied once over the summed mix, spec §4.F step 6): channel volume
/// (set-volume effects, sample volume) times the volume envelope times
/// fadeout, split left/right by panning.
fn target_gains(ch: &ChannelState) -> (f32, f32) {
    let volume = if ch.tremor_muted {
        0.0
    } else {
        (ch.volume * ch.volume_envelope_volume * ch.fadeout_volume).clamp(0.0, 1.0)
    };
    let pan = effective_panning(ch);
    (volume * (1.0 - pan), volume * pan)
}

/// Panning envelope steers panning around the channel's base position
/// (spec §4.E), pulled in proportionally less as the base approaches a
/// hard edge — a base panning of 0 or 1 cannot be pushed further by the
/// envelope.
fn effective_panning(ch: &ChannelState) -> f32 {
    let base = ch.panning;
    let env = ch.panning_envelope_panning;
    (base + (env - 0.5) * (0.5 - (base - 0.5).abs()) * 2.0).clamp(0.0, 1.0)
}

fn neighbor_frame(ch: &ChannelState, sample: &Sample, whole: i64) -> i16 {
    let len = sample.len_frames() as i64;
    if len == 0 {
        return 0;
    }
    match sample.loop_type {
        LoopType::PingPong if sample.has_loop() => {
            let start = sample.loop_start as i64;
            let end = sample.loop_end as i64;
            let dir: i64 = if ch.ping { 1 } else { -1 };
            let mut n = whole + dir;
            if n >= end {
                n = end - (n - end) - 1;
            }
            if n < start {
                n = start + (start - n) - 1;
            }
            sample.frame_i16(n.clamp(0, len - 1) as usize)
        }
        LoopType::Forward if sample.has_loop() => {
            let start = sample.loop_start as i64;
            let end = sample.loop_end as i64;
            let loop_len = end - start;
            let mut n = whole + 1;
            if n >= end {
                n = start + (n - end) % loop_len;
            }
            sample.frame_i16(n.clamp(0, len - 1) as usize)
        }
        _ => {
            let n = whole + 1;
            if n < len {
                sample.frame_i16(n as usize)
            } else {
                sample.frame_i16(whole.clamp(0, len - 1) as usize)
            }
        }
    }
}

/// Step `ch.sample_position` by one frame and apply the sample's loop
/// semantics (spec §4.F step 5): none (go inactive past the end), forward
/// (wrap modulo the loop span), ping-pong (reflect and flip direction).
fn advance_position(ch: &mut ChannelState, sample: &Sample) {
    let step = ch.step as i64;
    let len_fp = (sample.len_frames() as i64) << 16;

    match sample.loop_type {
        LoopType::PingPong if sample.has_loop() => {
            let signed_step = if ch.ping { step } else { -step };
            ch.sample_position += signed_step;
            let start = (sample.loop_start as i64) << 16;
            let end = (sample.loop_end as i64) << 16;
            for _ in 0..2 {
                if ch.sample_position >= end {
                    ch.sample_position = end - (ch.sample_position - end) - 1;
                    ch.ping = false;
                } else if ch.sample_position < start {
                    ch.sample_position = start + (start - ch.sample_position) - 1;
                    ch.ping = true;
                }
            }
        }
        LoopType::Forward if sample.has_loop() => {
            ch.sample_position += step;
            let start = (sample.loop_start as i64) << 16;
            let end = (sample.loop_end as i64) << 16;
            let loop_len = end - start;
            if ch.sample_position >= end && loop_len > 0 {
                ch.sample_position = start + (ch.sample_position - end) % loop_len;
            }
        }
        _ => {
            ch.sample_position += step;
            if ch.sample_position >= len_fp {
                ch.active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayString;
    use xm_ir::SampleBytes;

    fn square_sample(loop_type: LoopType) -> Sample<'static> {
        Sample {
            name: ArrayString::new(),
            bits: 8,
            data: SampleBytes::owned(alloc::vec![64i8 as u8, 64, 192, 192]),
            loop_start: 0,
            loop_end: 4,
            loop_type,
            volume: 1.0,
            panning: 0.5,
            finetune: 0,
            relative_note: 0,
        }
    }

    fn active_channel() -> ChannelState {
        let mut ch = ChannelState::new();
        ch.instrument = 1;
        ch.sample = 1;
        ch.active = true;
        ch.step = 1 << 16; // one sample frame per output frame
        ch.volume = 1.0;
        ch.actual_volume_left = 0.5;
        ch.actual_volume_right = 0.5;
        ch
    }

    #[test]
    fn inactive_channel_renders_silence() {
        let mut ch = ChannelState::new();
        let sample = square_sample(LoopType::None);
        assert_eq!(render_channel(&mut ch, &sample, Interpolation::Linear), (0.0, 0.0));
    }

    #[test]
    fn muted_channel_renders_silence_and_freezes_position() {
        let mut ch = active_channel();
        ch.muted = true;
        let sample = square_sample(LoopType::None);
        let pos_before = ch.sample_position;
        let out = render_channel(&mut ch, &sample, Interpolation::Linear);
        assert_eq!(out, (0.0, 0.0));
        assert_eq!(ch.sample_position, pos_before);
    }

    #[test]
    fn tremor_muted_channel_ramps_to_silence() {
        let mut ch = active_channel();
        ch.tremor_muted = true;
        let sample = square_sample(LoopType::Forward);
        for _ in 0..200 {
            render_channel(&mut ch, &sample, Interpolation::Linear);
        }
        assert_eq!(ch.actual_volume_left, 0.0);
        assert_eq!(ch.actual_volume_right, 0.0);
    }

    #[test]
    fn no_loop_sample_goes_inactive_past_end() {
        let mut ch = active_channel();
        let sample = square_sample(LoopType::None);
        for _ in 0..10 {
            render_channel(&mut ch, &sample, Interpolation::Linear);
        }
        assert!(!ch.active);
    }

    #[test]
    fn forward_loop_stays_active_and_wraps() {
        let mut ch = active_channel();
        let sample = square_sample(LoopType::Forward);
        for _ in 0..20 {
            render_channel(&mut ch, &sample, Interpolation::Linear);
        }
        assert!(ch.active);
        let whole = ch.sample_position >> 16;
        assert!(whole >= 0 && whole < 4);
    }

    #[test]
    fn ping_pong_loop_flips_direction() {
        let mut ch = active_channel();
        let sample = square_sample(LoopType::PingPong);
        let mut seen_reverse = false;
        for _ in 0..30 {
            render_channel(&mut ch, &sample, Interpolation::Linear);
            if !ch.ping {
                seen_reverse = true;
            }
        }
        assert!(ch.active);
        assert!(seen_reverse);
    }

    #[test]
    fn volume_ramps_toward_target_gradually() {
        let mut ch = active_channel();
        ch.actual_volume_left = 0.0;
        ch.actual_volume_right = 0.0;
        ch.volume = 1.0;
        ch.volume_envelope_volume = 1.0;
        ch.fadeout_volume = 1.0;
        ch.panning = 0.5;
        ch.panning_envelope_panning = 0.5;
        let sample = square_sample(LoopType::Forward);
        render_channel(&mut ch, &sample, Interpolation::Linear);
        assert!((ch.actual_volume_left - RAMP_STEP).abs() < 1e-6);
    }

    #[test]
    fn hard_panning_sends_all_gain_to_one_side() {
        let mut ch = active_channel();
        ch.panning = 0.0;
        ch.panning_envelope_panning = 0.5;
        ch.actual_volume_left = 1.0;
        ch.actual_volume_right = 1.0;
        let (target_l, target_r) = target_gains(&ch);
        assert!(target_l > 0.0);
        assert_eq!(target_r, 0.0);
    }
}
