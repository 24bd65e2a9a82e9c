//! Post-load module validator (spec component C, §4.C).
//!
//! Pre-load checks (magic, version, lengths fitting in the input) happen
//! inline while the loader reads the header; this pass runs once the whole
//! module graph exists and checks the invariants the renderer leans on
//! without re-checking at every tick (spec §3 "Invariants", §7).

use xm_ir::{Envelope, Module};

use crate::FormatError;

pub fn validate_postload(module: &Module) -> Result<(), FormatError> {
    if module.num_patterns() > 256 {
        return Err(FormatError::OutOfRange);
    }

    for i in 0..module.length as usize {
        let pattern_index = *module
            .pattern_table
            .get(i)
            .ok_or(FormatError::OutOfRange)?;
        if pattern_index as usize >= module.num_patterns() {
            return Err(FormatError::OutOfRange);
        }
    }

    for pattern in module.patterns.iter() {
        if pattern.rows == 0 || pattern.rows > 256 {
            return Err(FormatError::OutOfRange);
        }
    }

    for instrument in module.instruments.iter() {
        validate_envelope(&instrument.volume_envelope)?;
        validate_envelope(&instrument.panning_envelope)?;

        for &sample_index in instrument.sample_of_note.iter() {
            if sample_index != 0xFF && sample_index as usize >= instrument.samples.len() {
                return Err(FormatError::OutOfRange);
            }
        }
    }

    Ok(())
}

/// Every envelope point must strictly increase in `frame` (spec §3), and
/// the point count must fit the on-disk 12-point limit.
fn validate_envelope(env: &Envelope) -> Result<(), FormatError> {
    if env.points.len() > 12 {
        return Err(FormatError::EnvelopeMalformed);
    }
    let mut prev_frame = None;
    for point in env.points.iter() {
        if let Some(prev) = prev_frame {
            if point.frame <= prev {
                return Err(FormatError::EnvelopeMalformed);
            }
        }
        prev_frame = Some(point.frame);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::borrow::Cow;
    use alloc::vec;
    use arrayvec::ArrayString;
    use xm_ir::{FrequencyType, Instrument, Pattern};

    fn base_module() -> Module<'static> {
        Module {
            name: ArrayString::new(),
            tracker_name: ArrayString::new(),
            restart_position: 0,
            length: 1,
            pattern_table: Cow::Owned(vec![0]),
            frequency_type: FrequencyType::Amiga,
            num_channels: 1,
            default_tempo: 6,
            default_bpm: 125,
            patterns: vec![Pattern::new(1, 1)],
            instruments: vec![],
        }
    }

    #[test]
    fn valid_module_passes() {
        assert!(validate_postload(&base_module()).is_ok());
    }

    #[test]
    fn pattern_table_entry_out_of_range_fails() {
        let mut module = base_module();
        module.pattern_table = Cow::Owned(vec![5]);
        assert_eq!(
            validate_postload(&module),
            Err(FormatError::OutOfRange)
        );
    }

    #[test]
    fn non_increasing_envelope_frames_fail() {
        let mut module = base_module();
        let mut inst = Instrument::new("lead");
        inst.volume_envelope.add_point(10, 64);
        inst.volume_envelope.add_point(5, 0);
        module.instruments.push(inst);
        assert_eq!(
            validate_postload(&module),
            Err(FormatError::EnvelopeMalformed)
        );
    }

    #[test]
    fn sample_of_note_0xff_is_valid_none() {
        let mut module = base_module();
        let mut inst = Instrument::new("lead");
        inst.sample_of_note[0] = 0xFF;
        module.instruments.push(inst);
        assert!(validate_postload(&module).is_ok());
    }

    #[test]
    fn sample_of_note_out_of_range_fails() {
        let mut module = base_module();
        let mut inst = Instrument::new("lead");
        inst.sample_of_note[0] = 3;
        module.instruments.push(inst);
        assert_eq!(
            validate_postload(&module),
            Err(FormatError::OutOfRange)
        );
    }
}
