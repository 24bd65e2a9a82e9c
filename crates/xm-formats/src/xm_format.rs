//! FastTracker II XM binary loader (spec component B).
//!
//! Parses the on-disk layout exactly as FT2 v1.04 defines it (spec §4.B,
//! §6): magic + header, 256-entry pattern order table, packed patterns,
//! instrument/envelope descriptors, and delta-encoded sample PCM. Every read
//! goes through [`xm_ir::Reader`], so a truncated or hostile `bytes` slice
//! never causes a panic or an out-of-bounds read — it surfaces as
//! [`FormatError::Truncated`].

use alloc::borrow::Cow;
use alloc::vec;
use alloc::vec::Vec;
use arrayvec::ArrayString;

use xm_ir::{
    FrequencyType, Instrument, LoopType, Module, Pattern, Reader, Sample, SampleBytes, Slot,
    Waveform,
};

use crate::validate::validate_postload;
use crate::FormatError;

const MAGIC: &[u8; 17] = b"Extended Module: ";
const SUPPORTED_VERSION: u16 = 0x0104;

/// Parse and validate an XM file's bytes into a [`Module`].
///
/// Pre-load checks (magic, version, declared lengths fitting in `bytes`)
/// happen inline as the header is read; [`validate_postload`] runs once the
/// full graph is built (spec §4.C). Either a fully valid module comes back
/// or no partial module survives.
pub fn load(bytes: &[u8]) -> Result<Module<'static>, FormatError> {
    let mut r = Reader::new(bytes, bytes.len());

    let magic = r.read_bytes(MAGIC.len())?;
    if magic != MAGIC {
        return Err(FormatError::Magic);
    }
    let name = read_name::<20>(&mut r)?;
    let _eof_marker = r.read_u8()?; // 0x1A, not checked: some tools write garbage here
    let tracker_name = read_name::<20>(&mut r)?;
    let version = r.read_u16le()?;
    if version != SUPPORTED_VERSION {
        return Err(FormatError::Version);
    }

    let header_start = r.position();
    let header_size = r.read_u32le()? as usize;
    let song_length = r.read_u16le()?;
    let restart_position = r.read_u16le()?;
    let num_channels = r.read_u16le()?;
    let num_patterns_declared = r.read_u16le()?;
    let num_instruments_declared = r.read_u16le()?;
    let flags = r.read_u16le()?;
    let default_tempo = r.read_u16le()?;
    let default_bpm = r.read_u16le()?;
    let mut pattern_table = vec![0u8; 256];
    pattern_table.copy_from_slice(r.read_bytes(256)?);
    r.seek(header_start + header_size)?;

    if num_channels == 0 || num_channels > 32 {
        return Err(FormatError::OutOfRange);
    }
    let num_channels = num_channels as u8;

    let mut patterns = Vec::with_capacity(num_patterns_declared as usize);
    for _ in 0..num_patterns_declared {
        patterns.push(read_pattern(&mut r, num_channels)?);
    }

    let mut instruments = Vec::with_capacity(num_instruments_declared as usize);
    for _ in 0..num_instruments_declared {
        instruments.push(read_instrument(&mut r)?);
    }

    pattern_table.truncate(song_length.max(1) as usize);

    let module = Module {
        name,
        tracker_name,
        restart_position,
        length: song_length,
        pattern_table: Cow::Owned(pattern_table),
        frequency_type: if flags & 0x01 != 0 {
            FrequencyType::Linear
        } else {
            FrequencyType::Amiga
        },
        num_channels,
        default_tempo: default_tempo.clamp(1, 31) as u8,
        default_bpm: default_bpm.clamp(32, 255) as u8,
        patterns,
        instruments,
    };

    validate_postload(&module)?;
    Ok(module)
}

fn read_name<const N: usize>(r: &mut Reader) -> Result<ArrayString<N>, FormatError> {
    let raw = r.read_bytes(N)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(N);
    let s = core::str::from_utf8(&raw[..end]).unwrap_or("").trim_end();
    let mut out = ArrayString::new();
    let _ = out.try_push_str(s);
    Ok(out)
}

fn read_pattern(r: &mut Reader, num_channels: u8) -> Result<Pattern<'static>, FormatError> {
    let pat_header_start = r.position();
    let pat_header_size = r.read_u32le()? as usize;
    let packing_type = r.read_u8()?;
    let num_rows = r.read_u16le()?;
    let packed_size = r.read_u16le()?;
    if packing_type != 0 {
        return Err(FormatError::OutOfRange);
    }
    r.seek(pat_header_start + pat_header_size)?;

    if num_rows == 0 || num_rows > 256 {
        return Err(FormatError::OutOfRange);
    }
    let count = num_rows as usize * num_channels as usize;

    let data = if packed_size == 0 {
        vec![Slot::empty(); count]
    } else {
        let raw = r.read_bytes(packed_size as usize)?;
        decode_pattern_slots(raw, count)?
    };

    Ok(Pattern {
        rows: num_rows,
        channels: num_channels,
        data: Cow::Owned(data),
    })
}

/// Decompress a packed row of slots (spec §4.B): if the lead byte's bit 7 is
/// set, its low 5 bits are a presence mask for
/// `{note, instrument, volume, effect_type, effect_param}` and only present
/// fields follow; otherwise the lead byte itself is the note and all four
/// remaining fields follow unconditionally.
fn decode_pattern_slots(raw: &[u8], count: usize) -> Result<Vec<Slot>, FormatError> {
    let mut r = Reader::new(raw, raw.len());
    let mut slots = Vec::with_capacity(count);
    for _ in 0..count {
        let mut slot = Slot::empty();
        let first = r.read_u8()?;
        if first & 0x80 != 0 {
            if first & 0x01 != 0 {
                slot.note = r.read_u8()?;
            }
            if first & 0x02 != 0 {
                slot.instrument = r.read_u8()?;
            }
            if first & 0x04 != 0 {
                slot.volume_column = r.read_u8()?;
            }
            if first & 0x08 != 0 {
                slot.effect_type = r.read_u8()?;
            }
            if first & 0x10 != 0 {
                slot.effect_param = r.read_u8()?;
            }
        } else {
            slot.note = first;
            slot.instrument = r.read_u8()?;
            slot.volume_column = r.read_u8()?;
            slot.effect_type = r.read_u8()?;
            slot.effect_param = r.read_u8()?;
        }
        slots.push(slot);
    }
    Ok(slots)
}

fn read_instrument(r: &mut Reader) -> Result<Instrument<'static>, FormatError> {
    let inst_start = r.position();
    let inst_header_size = r.read_u32le()? as usize;
    let name = read_name::<22>(r)?;
    let _inst_type = r.read_u8()?;
    let num_samples = r.read_u16le()?;

    let mut inst = Instrument::new(&name);

    if num_samples == 0 {
        r.seek(inst_start + inst_header_size)?;
        return Ok(inst);
    }

    let sample_header_size = r.read_u32le()? as usize;
    let mut sample_of_note = [0u8; 96];
    sample_of_note.copy_from_slice(r.read_bytes(96)?);

    let mut vol_points = [(0u16, 0u8); 12];
    for point in vol_points.iter_mut() {
        let frame = r.read_u16le()?;
        let value = r.read_u16le()?;
        *point = (frame, value.min(64) as u8);
    }
    let mut pan_points = [(0u16, 0u8); 12];
    for point in pan_points.iter_mut() {
        let frame = r.read_u16le()?;
        let value = r.read_u16le()?;
        *point = (frame, value.min(64) as u8);
    }
    let num_vol_points = r.read_u8()?.min(12);
    let num_pan_points = r.read_u8()?.min(12);
    let vol_sustain = r.read_u8()?;
    let vol_loop_start = r.read_u8()?;
    let vol_loop_end = r.read_u8()?;
    let pan_sustain = r.read_u8()?;
    let pan_loop_start = r.read_u8()?;
    let pan_loop_end = r.read_u8()?;
    let vol_type = r.read_u8()?;
    let pan_type = r.read_u8()?;
    let vibrato_waveform = r.read_u8()?;
    let vibrato_sweep = r.read_u8()?;
    let vibrato_depth = r.read_u8()?;
    let vibrato_rate = r.read_u8()?;
    let volume_fadeout = r.read_u16le()?;

    inst.sample_of_note = sample_of_note;
    for &(frame, value) in vol_points[..num_vol_points as usize].iter() {
        inst.volume_envelope.add_point(frame, value);
    }
    inst.volume_envelope.enabled = vol_type & 0x01 != 0;
    inst.volume_envelope.sustain = vol_type & 0x02 != 0;
    inst.volume_envelope.loop_ = vol_type & 0x04 != 0;
    inst.volume_envelope.sustain_point = vol_sustain;
    inst.volume_envelope.loop_start_point = vol_loop_start;
    inst.volume_envelope.loop_end_point = vol_loop_end;

    for &(frame, value) in pan_points[..num_pan_points as usize].iter() {
        inst.panning_envelope.add_point(frame, value);
    }
    inst.panning_envelope.enabled = pan_type & 0x01 != 0;
    inst.panning_envelope.sustain = pan_type & 0x02 != 0;
    inst.panning_envelope.loop_ = pan_type & 0x04 != 0;
    inst.panning_envelope.sustain_point = pan_sustain;
    inst.panning_envelope.loop_start_point = pan_loop_start;
    inst.panning_envelope.loop_end_point = pan_loop_end;

    inst.volume_fadeout = volume_fadeout;
    inst.vibrato_waveform = Waveform::from_raw(vibrato_waveform);
    inst.vibrato_sweep = vibrato_sweep;
    inst.vibrato_depth = vibrato_depth;
    inst.vibrato_rate = vibrato_rate;

    r.seek(inst_start + inst_header_size)?;

    struct RawSampleHeader {
        length: u32,
        loop_start: u32,
        loop_end: u32,
        volume: u8,
        finetune: i8,
        type_byte: u8,
        panning: u8,
        relative_note: i8,
        name: ArrayString<22>,
    }

    let mut headers = Vec::with_capacity(num_samples as usize);
    for _ in 0..num_samples {
        let sh_start = r.position();
        let length = r.read_u32le()?;
        let loop_start = r.read_u32le()?;
        let loop_end = r.read_u32le()?;
        let volume = r.read_u8()?;
        let finetune = r.read_i8()?;
        let type_byte = r.read_u8()?;
        let panning = r.read_u8()?;
        let relative_note = r.read_i8()?;
        let _reserved = r.read_u8()?;
        let name = read_name::<22>(r)?;
        r.seek(sh_start + sample_header_size)?;
        headers.push(RawSampleHeader {
            length,
            loop_start,
            loop_end,
            volume,
            finetune,
            type_byte,
            panning,
            relative_note,
            name,
        });
    }

    for hdr in headers {
        let bits16 = hdr.type_byte & 0x10 != 0;
        let byte_len = hdr.length as usize;
        let raw = r.read_bytes(byte_len)?;
        let data = if bits16 {
            delta_decode_16(raw)
        } else {
            delta_decode_8(raw)
        };

        let (loop_start, loop_end) = if bits16 {
            (hdr.loop_start / 2, hdr.loop_end / 2)
        } else {
            (hdr.loop_start, hdr.loop_end)
        };
        let mut loop_type = match hdr.type_byte & 0x03 {
            1 => LoopType::Forward,
            2 | 3 => LoopType::PingPong,
            _ => LoopType::None,
        };
        // Spec §7: a sample whose declared loop doesn't make sense degrades
        // to "no loop" rather than failing the whole load.
        if loop_end <= loop_start {
            loop_type = LoopType::None;
        }

        inst.samples.push(Sample {
            name: hdr.name,
            bits: if bits16 { 16 } else { 8 },
            data: SampleBytes::owned(data),
            loop_start,
            loop_end,
            loop_type,
            volume: (hdr.volume.min(64) as f32) / 64.0,
            panning: hdr.panning as f32 / 255.0,
            finetune: hdr.finetune,
            relative_note: hdr.relative_note,
        });
    }

    Ok(inst)
}

/// 8-bit samples are stored as signed deltas from the previous frame
/// (spec §4.B): `old[i] = old[i-1] + delta[i]`, wrapping on overflow.
fn delta_decode_8(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut acc: i8 = 0;
    for &b in raw {
        acc = acc.wrapping_add(b as i8);
        out.push(acc as u8);
    }
    out
}

fn delta_decode_16(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut acc: i16 = 0;
    for chunk in raw.chunks(2) {
        if chunk.len() < 2 {
            break;
        }
        let delta = i16::from_le_bytes([chunk[0], chunk[1]]);
        acc = acc.wrapping_add(delta);
        out.extend_from_slice(&acc.to_le_bytes());
    }
    out
}
