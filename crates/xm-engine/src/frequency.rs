//! Note/period/frequency conversion (spec §4.E).
//!
//! XM tracks pitch as a "period" rather than a frequency directly, so that
//! portamento effects can add/subtract a constant per tick regardless of
//! the note's octave. `period_to_frequency` is the single place that turns
//! a period back into Hz for the mixer's sample-step computation.

use xm_ir::FrequencyType;

/// Period for note 0 (the lowest representable note) at zero finetune.
const PERIOD_BASE: i32 = 7680;

/// Semitones are 64 period units apart (so 12*64 = 768 units/octave,
/// matching the `/768` exponent divisor below).
const PERIOD_PER_SEMITONE: i32 = 64;

/// Reference frequency (Hz) at period `PERIOD_BASE - 48*64` (C-4, the
/// conventional "note 48" reference used throughout the XM format).
const C4_FREQUENCY: f64 = 8363.0;

/// Note+finetune → period. FT2's Amiga mode quantizes this curve through a
/// 96-entry hardware-period lookup table (12 semitones × 8 finetune steps,
/// halved per octave); Linear mode is the same curve evaluated continuously.
/// Both converge to the same pitch at integer notes and zero finetune, and
/// the gap elsewhere is the classic Amiga tuning "wobble" rather than a
/// different scale (see DESIGN.md) — continuous evaluation is used for both
/// modes here rather than reproducing the lookup table bit-for-bit.
pub fn note_to_period(note: i32, finetune: i8) -> i32 {
    PERIOD_BASE - note * PERIOD_PER_SEMITONE - (finetune as i32 * PERIOD_PER_SEMITONE) / 256
}

/// Period → frequency in Hz, per spec §4.E:
/// `freq = 8363 * 2^((4608 - period)/768)`.
pub fn period_to_frequency(period: i32, _frequency_type: FrequencyType) -> f64 {
    let exponent = (4608 - period) as f64 / 768.0;
    C4_FREQUENCY * libm::exp2(exponent)
}

/// Frequency (Hz) → 16.16 fixed-point per-frame sample-position increment.
pub fn frequency_to_step(freq: f64, sample_rate: u32) -> u32 {
    if sample_rate == 0 || freq <= 0.0 {
        return 0;
    }
    ((freq * 65536.0) / sample_rate as f64) as u32
}

/// Convenience: note+finetune+relative_note straight to a fixed-point step.
pub fn note_to_step(
    note: i32,
    finetune: i8,
    relative_note: i8,
    frequency_type: FrequencyType,
    sample_rate: u32,
) -> u32 {
    let period = note_to_period(note + relative_note as i32, finetune);
    let freq = period_to_frequency(period, frequency_type);
    frequency_to_step(freq, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c4_note_yields_reference_frequency() {
        let period = note_to_period(48, 0);
        let freq = period_to_frequency(period, FrequencyType::Linear);
        assert!((freq - C4_FREQUENCY).abs() < 0.5);
    }

    #[test]
    fn octave_up_doubles_frequency() {
        let base = period_to_frequency(note_to_period(48, 0), FrequencyType::Linear);
        let up = period_to_frequency(note_to_period(60, 0), FrequencyType::Linear);
        assert!((up - base * 2.0).abs() < 1.0);
    }

    #[test]
    fn octave_down_halves_frequency() {
        let base = period_to_frequency(note_to_period(48, 0), FrequencyType::Linear);
        let down = period_to_frequency(note_to_period(36, 0), FrequencyType::Linear);
        assert!((down - base / 2.0).abs() < 1.0);
    }

    #[test]
    fn higher_period_is_lower_pitch() {
        let low_note_period = note_to_period(36, 0);
        let high_note_period = note_to_period(60, 0);
        assert!(low_note_period > high_note_period);
    }

    #[test]
    fn zero_sample_rate_yields_zero_step() {
        assert_eq!(frequency_to_step(440.0, 0), 0);
    }

    #[test]
    fn step_scales_inversely_with_sample_rate() {
        let a = frequency_to_step(8363.0, 44100);
        let b = frequency_to_step(8363.0, 88200);
        assert!((a as i64 - b as i64 * 2).abs() <= 1);
    }
}
