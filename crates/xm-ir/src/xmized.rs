//! The "xmized" serialized-image codec (Component D).
//!
//! `encode` produces a flat, versioned byte image of a [`Module`].
//! `decode_owned` rehydrates it into a fully owned `Module<'static>`.
//! `decode_shared` rehydrates it into a `Module<'a>` whose pattern-slot
//! grids and sample PCM are borrowed directly out of `bytes` rather than
//! copied — the "shared-const restore" mode (spec §4.D), letting a module
//! live untouched in read-only memory while only per-context scalars are
//! freshly allocated.
//!
//! This trades the original's pointer-offset arena for indices/borrows, per
//! Design Notes §9: "prefer indices... the xmized image then becomes a
//! straightforward serialization... without pointer fixups."

use alloc::borrow::Cow;
use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::envelope::{Envelope, EnvelopePoint};
use crate::instrument::{Instrument, Waveform};
use crate::module::{FrequencyType, Module};
use crate::pattern::{Pattern, Slot};
use crate::reader::{Reader, Truncated};
use crate::sample::{LoopType, Sample, SampleBytes};

/// Byte size of one flattened [`Slot`] record in the image.
const SLOT_SIZE: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmizedError {
    Truncated,
    /// The image's declared `ctx_size` does not match its actual length.
    SizeMismatch,
}

impl From<Truncated> for XmizedError {
    fn from(_: Truncated) -> Self {
        Self::Truncated
    }
}

fn push_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}
fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn push_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn push_fixed_str(out: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    out.extend_from_slice(&bytes[..n]);
    for _ in n..len {
        out.push(0);
    }
}

fn push_envelope(out: &mut Vec<u8>, env: &Envelope) {
    push_u8(out, env.points.len() as u8);
    for p in env.points.iter() {
        push_u16(out, p.frame);
        push_u8(out, p.value);
    }
    push_u8(out, env.enabled as u8);
    push_u8(out, env.sustain as u8);
    push_u8(out, env.sustain_point);
    push_u8(out, env.loop_ as u8);
    push_u8(out, env.loop_start_point);
    push_u8(out, env.loop_end_point);
}

fn read_envelope(r: &mut Reader) -> Result<Envelope, XmizedError> {
    let n = r.read_u8()?;
    let mut env = Envelope::new();
    for _ in 0..n {
        let frame = r.read_u16le()?;
        let value = r.read_u8()?;
        env.add_point(frame, value);
    }
    env.enabled = r.read_u8()? != 0;
    env.sustain = r.read_u8()? != 0;
    env.sustain_point = r.read_u8()?;
    env.loop_ = r.read_u8()? != 0;
    env.loop_start_point = r.read_u8()?;
    env.loop_end_point = r.read_u8()?;
    Ok(env)
}

fn push_sample(out: &mut Vec<u8>, s: &Sample) {
    push_fixed_str(out, &s.name, 22);
    push_u8(out, s.bits);
    push_u32(out, s.loop_start);
    push_u32(out, s.loop_end);
    push_u8(out, s.loop_type as u8);
    push_f32(out, s.volume);
    push_f32(out, s.panning);
    push_u8(out, s.finetune as u8);
    push_u8(out, s.relative_note as u8);
    let bytes = s.data.as_bytes();
    push_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn loop_type_from_raw(v: u8) -> LoopType {
    match v {
        1 => LoopType::Forward,
        2 => LoopType::PingPong,
        _ => LoopType::None,
    }
}

/// Cast a byte range known to hold `count` flattened [`Slot`]s into a
/// borrowed `&[Slot]`, with no copy. Safe because [`Slot`] is `repr(C)`,
/// consists solely of `u8` fields (no padding, alignment 1), and `bytes` is
/// checked to be exactly `count * SLOT_SIZE` long before the cast — the
/// narrow unsafe boundary Design Notes §9 permits for exact-byte-layout
/// reuse.
fn slots_from_bytes(bytes: &[u8], count: usize) -> &[Slot] {
    debug_assert_eq!(bytes.len(), count * SLOT_SIZE);
    unsafe { core::slice::from_raw_parts(bytes.as_ptr() as *const Slot, count) }
}

fn slots_to_owned(bytes: &[u8], count: usize) -> Vec<Slot> {
    let mut v = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(SLOT_SIZE) {
        v.push(Slot {
            note: chunk[0],
            instrument: chunk[1],
            volume_column: chunk[2],
            effect_type: chunk[3],
            effect_param: chunk[4],
        });
    }
    v
}

/// Serialize `module` into a relocatable byte image (spec §4.D). The first
/// four bytes are the total image length (`ctx_size`), matching the
/// original format's convention of leading with its own size.
pub fn encode(module: &Module) -> Vec<u8> {
    let mut body = Vec::new();

    push_fixed_str(&mut body, &module.name, 20);
    push_fixed_str(&mut body, &module.tracker_name, 20);
    push_u16(&mut body, module.restart_position);
    push_u16(&mut body, module.length);
    push_u16(&mut body, module.pattern_table.len() as u16);
    body.extend_from_slice(&module.pattern_table);
    push_u8(&mut body, module.frequency_type as u8);
    push_u8(&mut body, module.num_channels);
    push_u8(&mut body, module.default_tempo);
    push_u8(&mut body, module.default_bpm);

    push_u16(&mut body, module.patterns.len() as u16);
    for pat in module.patterns.iter() {
        push_u16(&mut body, pat.rows);
        push_u8(&mut body, pat.channels);
        for slot in pat.data.iter() {
            push_u8(&mut body, slot.note);
            push_u8(&mut body, slot.instrument);
            push_u8(&mut body, slot.volume_column);
            push_u8(&mut body, slot.effect_type);
            push_u8(&mut body, slot.effect_param);
        }
    }

    push_u16(&mut body, module.instruments.len() as u16);
    for inst in module.instruments.iter() {
        push_fixed_str(&mut body, &inst.name, 26);
        body.extend_from_slice(&inst.sample_of_note);
        push_envelope(&mut body, &inst.volume_envelope);
        push_envelope(&mut body, &inst.panning_envelope);
        push_u16(&mut body, inst.volume_fadeout);
        push_u8(&mut body, inst.vibrato_waveform as u8);
        push_u8(&mut body, inst.vibrato_sweep);
        push_u8(&mut body, inst.vibrato_depth);
        push_u8(&mut body, inst.vibrato_rate);
        push_u16(&mut body, inst.samples.len() as u16);
        for sample in inst.samples.iter() {
            push_sample(&mut body, sample);
        }
    }

    let mut out = Vec::with_capacity(body.len() + 4);
    push_u32(&mut out, (body.len() + 4) as u32);
    out.extend_from_slice(&body);
    out
}

fn check_ctx_size(bytes: &[u8]) -> Result<(), XmizedError> {
    if bytes.len() < 4 {
        return Err(XmizedError::Truncated);
    }
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared != bytes.len() {
        return Err(XmizedError::SizeMismatch);
    }
    Ok(())
}

/// Owning restore: every field is freshly allocated, independent of `bytes`.
pub fn decode_owned(bytes: &[u8]) -> Result<Module<'static>, XmizedError> {
    check_ctx_size(bytes)?;
    let mut r = Reader::new(bytes, bytes.len());
    r.skip(4)?;

    let name = read_fixed_str::<20>(&mut r)?;
    let tracker_name = read_fixed_str::<20>(&mut r)?;
    let restart_position = r.read_u16le()?;
    let length = r.read_u16le()?;
    let table_len = r.read_u16le()? as usize;
    let pattern_table = r.read_bytes(table_len)?.to_vec();
    let frequency_type = frequency_type_from_raw(r.read_u8()?);
    let num_channels = r.read_u8()?;
    let default_tempo = r.read_u8()?;
    let default_bpm = r.read_u8()?;

    let num_patterns = r.read_u16le()?;
    let mut patterns = Vec::with_capacity(num_patterns as usize);
    for _ in 0..num_patterns {
        let rows = r.read_u16le()?;
        let channels = r.read_u8()?;
        let count = rows as usize * channels as usize;
        let raw = r.read_bytes(count * SLOT_SIZE)?;
        patterns.push(Pattern {
            rows,
            channels,
            data: Cow::Owned(slots_to_owned(raw, count)),
        });
    }

    let num_instruments = r.read_u16le()?;
    let mut instruments = Vec::with_capacity(num_instruments as usize);
    for _ in 0..num_instruments {
        instruments.push(read_instrument_owned(&mut r)?);
    }

    Ok(Module {
        name,
        tracker_name,
        restart_position,
        length,
        pattern_table: Cow::Owned(pattern_table),
        frequency_type,
        num_channels,
        default_tempo,
        default_bpm,
        patterns,
        instruments,
    })
}

/// Shared-const restore: pattern slots and sample PCM borrow `bytes`
/// directly; only per-context scalars and descriptor structs are
/// allocated. Caller must keep `bytes` alive for as long as the returned
/// `Module` (spec §4.D's "image outlives every context derived from it").
pub fn decode_shared(bytes: &[u8]) -> Result<Module<'_>, XmizedError> {
    check_ctx_size(bytes)?;
    let mut r = Reader::new(bytes, bytes.len());
    r.skip(4)?;

    let name = read_fixed_str::<20>(&mut r)?;
    let tracker_name = read_fixed_str::<20>(&mut r)?;
    let restart_position = r.read_u16le()?;
    let length = r.read_u16le()?;
    let table_len = r.read_u16le()? as usize;
    let pattern_table = r.read_bytes(table_len)?;
    let frequency_type = frequency_type_from_raw(r.read_u8()?);
    let num_channels = r.read_u8()?;
    let default_tempo = r.read_u8()?;
    let default_bpm = r.read_u8()?;

    let num_patterns = r.read_u16le()?;
    let mut patterns = Vec::with_capacity(num_patterns as usize);
    for _ in 0..num_patterns {
        let rows = r.read_u16le()?;
        let channels = r.read_u8()?;
        let count = rows as usize * channels as usize;
        let raw = r.read_bytes(count * SLOT_SIZE)?;
        patterns.push(Pattern {
            rows,
            channels,
            data: Cow::Borrowed(slots_from_bytes(raw, count)),
        });
    }

    let num_instruments = r.read_u16le()?;
    let mut instruments = Vec::with_capacity(num_instruments as usize);
    for _ in 0..num_instruments {
        instruments.push(read_instrument_shared(&mut r)?);
    }

    Ok(Module {
        name,
        tracker_name,
        restart_position,
        length,
        pattern_table: Cow::Borrowed(pattern_table),
        frequency_type,
        num_channels,
        default_tempo,
        default_bpm,
        patterns,
        instruments,
    })
}

fn read_fixed_str<const N: usize>(r: &mut Reader) -> Result<ArrayString<N>, XmizedError> {
    let raw = r.read_bytes(N)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(N);
    let s = core::str::from_utf8(&raw[..end]).unwrap_or("");
    let mut out = ArrayString::new();
    let _ = out.try_push_str(s);
    Ok(out)
}

fn frequency_type_from_raw(v: u8) -> FrequencyType {
    if v == 1 {
        FrequencyType::Linear
    } else {
        FrequencyType::Amiga
    }
}

fn read_instrument_owned(r: &mut Reader) -> Result<Instrument<'static>, XmizedError> {
    let name = read_fixed_str::<26>(r)?;
    let mut sample_of_note = [0u8; 96];
    sample_of_note.copy_from_slice(r.read_bytes(96)?);
    let volume_envelope = read_envelope(r)?;
    let panning_envelope = read_envelope(r)?;
    let volume_fadeout = r.read_u16le()?;
    let vibrato_waveform = Waveform::from_raw(r.read_u8()?);
    let vibrato_sweep = r.read_u8()?;
    let vibrato_depth = r.read_u8()?;
    let vibrato_rate = r.read_u8()?;
    let num_samples = r.read_u16le()?;
    let mut samples = Vec::with_capacity(num_samples as usize);
    for _ in 0..num_samples {
        samples.push(read_sample_owned(r)?);
    }
    Ok(Instrument {
        name,
        sample_of_note,
        volume_envelope,
        panning_envelope,
        volume_fadeout,
        vibrato_waveform,
        vibrato_sweep,
        vibrato_depth,
        vibrato_rate,
        samples,
    })
}

fn read_instrument_shared<'a>(r: &mut Reader<'a>) -> Result<Instrument<'a>, XmizedError> {
    let name = read_fixed_str::<26>(r)?;
    let mut sample_of_note = [0u8; 96];
    sample_of_note.copy_from_slice(r.read_bytes(96)?);
    let volume_envelope = read_envelope(r)?;
    let panning_envelope = read_envelope(r)?;
    let volume_fadeout = r.read_u16le()?;
    let vibrato_waveform = Waveform::from_raw(r.read_u8()?);
    let vibrato_sweep = r.read_u8()?;
    let vibrato_depth = r.read_u8()?;
    let vibrato_rate = r.read_u8()?;
    let num_samples = r.read_u16le()?;
    let mut samples = Vec::with_capacity(num_samples as usize);
    for _ in 0..num_samples {
        samples.push(read_sample_shared(r)?);
    }
    Ok(Instrument {
        name,
        sample_of_note,
        volume_envelope,
        panning_envelope,
        volume_fadeout,
        vibrato_waveform,
        vibrato_sweep,
        vibrato_depth,
        vibrato_rate,
        samples,
    })
}

fn read_sample_owned(r: &mut Reader) -> Result<Sample<'static>, XmizedError> {
    let name = read_fixed_str::<22>(r)?;
    let bits = r.read_u8()?;
    let loop_start = r.read_u32le()?;
    let loop_end = r.read_u32le()?;
    let loop_type = loop_type_from_raw(r.read_u8()?);
    let volume = read_f32(r)?;
    let panning = read_f32(r)?;
    let finetune = r.read_i8()?;
    let relative_note = r.read_i8()?;
    let data_len = r.read_u32le()? as usize;
    let data = r.read_bytes(data_len)?.to_vec();
    Ok(Sample {
        name,
        bits,
        data: SampleBytes::owned(data),
        loop_start,
        loop_end,
        loop_type,
        volume,
        panning,
        finetune,
        relative_note,
    })
}

fn read_sample_shared<'a>(r: &mut Reader<'a>) -> Result<Sample<'a>, XmizedError> {
    let name = read_fixed_str::<22>(r)?;
    let bits = r.read_u8()?;
    let loop_start = r.read_u32le()?;
    let loop_end = r.read_u32le()?;
    let loop_type = loop_type_from_raw(r.read_u8()?);
    let volume = read_f32(r)?;
    let panning = read_f32(r)?;
    let finetune = r.read_i8()?;
    let relative_note = r.read_i8()?;
    let data_len = r.read_u32le()? as usize;
    let data = r.read_bytes(data_len)?;
    Ok(Sample {
        name,
        bits,
        data: SampleBytes::borrowed(data),
        loop_start,
        loop_end,
        loop_type,
        volume,
        panning,
        finetune,
        relative_note,
    })
}

fn read_f32(r: &mut Reader) -> Result<f32, XmizedError> {
    Ok(f32::from_bits(r.read_u32le()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    fn sample_module() -> Module<'static> {
        let mut pattern = Pattern::new(2, 1);
        pattern.slot_mut(0, 0).note = 49;
        pattern.slot_mut(0, 0).instrument = 1;

        let mut inst = Instrument::new("square");
        inst.samples.push(Sample {
            data: SampleBytes::owned(alloc::vec![64i8 as u8, 64, 192, 192]),
            bits: 8,
            loop_start: 0,
            loop_end: 4,
            loop_type: LoopType::Forward,
            ..Sample::default()
        });

        Module {
            name: ArrayString::new(),
            tracker_name: ArrayString::new(),
            restart_position: 0,
            length: 1,
            pattern_table: Cow::Owned(alloc::vec![0]),
            frequency_type: FrequencyType::Amiga,
            num_channels: 1,
            default_tempo: 6,
            default_bpm: 125,
            patterns: alloc::vec![pattern],
            instruments: alloc::vec![inst],
        }
    }

    #[test]
    fn owned_round_trip_preserves_slot_and_pcm_data() {
        let module = sample_module();
        let image = encode(&module);
        let restored = decode_owned(&image).unwrap();
        assert_eq!(restored.patterns[0].slot(0, 0).note, 49);
        assert_eq!(
            restored.instruments[0].samples[0].data.as_bytes(),
            module.instruments[0].samples[0].data.as_bytes()
        );
    }

    #[test]
    fn shared_restore_borrows_from_the_image() {
        let module = sample_module();
        let image = encode(&module);
        let restored = decode_shared(&image).unwrap();
        assert!(matches!(restored.patterns[0].data, Cow::Borrowed(_)));
        assert!(matches!(
            restored.instruments[0].samples[0].data.0,
            Cow::Borrowed(_)
        ));
        assert_eq!(restored.patterns[0].slot(0, 0).instrument, 1);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut image = encode(&sample_module());
        image[0] ^= 0xFF;
        assert!(matches!(
            decode_owned(&image),
            Err(XmizedError::SizeMismatch)
        ));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let image = encode(&sample_module());
        assert!(matches!(
            decode_owned(&image[..image.len() - 10]),
            Err(XmizedError::SizeMismatch)
        ));
    }
}
