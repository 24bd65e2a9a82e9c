use std::borrow::Cow;

use arrayvec::ArrayString;
use criterion::{criterion_group, criterion_main, Criterion};
use xm_engine::Player;
use xm_ir::{FrequencyType, Instrument, LoopType, Module, Pattern, Sample, SampleBytes};

/// A small four-channel, four-pattern module with a looping sample on
/// every channel, big enough to exercise the full per-frame render path
/// (interpolation, ramping, envelope advance) without a real XM fixture.
fn bench_module() -> Module<'static> {
    let channels = 4u8;
    let mut patterns = Vec::new();
    for _ in 0..4 {
        let mut pattern = Pattern::new(64, channels);
        for row in 0..64u16 {
            for ch in 0..channels {
                if row % 4 == 0 {
                    let slot = pattern.slot_mut(row, ch);
                    slot.note = 49 + (row as u8 % 12);
                    slot.instrument = 1;
                }
            }
        }
        patterns.push(pattern);
    }

    let mut sample = Sample::default();
    sample.data = SampleBytes::owned(vec![0u8; 4096]);
    sample.loop_type = LoopType::Forward;
    sample.loop_start = 0;
    sample.loop_end = 4096;
    sample.volume = 1.0;
    sample.panning = 0.5;

    let mut instrument = Instrument::new("bench");
    instrument.samples.push(sample);

    Module {
        name: ArrayString::new(),
        tracker_name: ArrayString::new(),
        restart_position: 0,
        length: 4,
        pattern_table: Cow::Owned(vec![0, 1, 2, 3]),
        frequency_type: FrequencyType::Linear,
        num_channels: channels,
        default_tempo: 6,
        default_bpm: 125,
        patterns,
        instruments: vec![instrument],
    }
}

fn generate_samples_benchmark(c: &mut Criterion) {
    let module = bench_module();
    let mut player = Player::new(&module, 44100);
    let mut out = vec![0.0f32; 1024 * 2];

    c.bench_function("generate_samples_4ch_1024frames", |b| {
        b.iter(|| player.generate_samples(&mut out));
    });
}

criterion_group!(benches, generate_samples_benchmark);
criterion_main!(benches);
