//! Hot-path benchmarks for the per-frame cost of wire encoding, channel
//! conversion, jitter buffer traffic and level metering.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use netmic::audio::framer::FrameAssembler;
use netmic::audio::jitter::JitterBuffer;
use netmic::audio::meter::rms;
use netmic::audio::AudioFrame;
use netmic::config::JitterConfig;
use netmic::protocol::Packet;

fn frame(sequence: u32) -> AudioFrame {
    AudioFrame {
        sequence,
        timestamp_us: 0,
        sample_rate: 48000,
        channels: 1,
        samples: vec![100; 960],
    }
}

fn bench_protocol(c: &mut Criterion) {
    let packet = Packet::Audio {
        sequence: 42,
        sample_rate: 48000,
        channels: 1,
        samples: vec![123; 960],
    };
    let wire = packet.encode();

    c.bench_function("encode_20ms_frame", |b| {
        b.iter(|| black_box(&packet).encode())
    });
    c.bench_function("decode_20ms_frame", |b| {
        b.iter(|| Packet::decode(black_box(&wire)).unwrap())
    });
}

fn bench_framer(c: &mut Criterion) {
    let stereo_block: Vec<f32> = (0..1920).map(|i| (i as f32 / 1920.0) - 0.5).collect();

    c.bench_function("frame_stereo_block_to_mono", |b| {
        let mut assembler = FrameAssembler::new(2, 1, 48000, 960);
        b.iter(|| assembler.push_block(black_box(&stereo_block)))
    });
}

fn bench_jitter(c: &mut Criterion) {
    c.bench_function("jitter_insert_pop_cycle", |b| {
        let mut buffer = JitterBuffer::new(&JitterConfig::default(), 960);
        for seq in 0..3 {
            buffer.insert(frame(seq));
        }
        let mut seq = 3u32;
        b.iter(|| {
            buffer.insert(frame(seq));
            seq = seq.wrapping_add(1);
            black_box(buffer.pop_next())
        })
    });
}

fn bench_meter(c: &mut Criterion) {
    let samples: Vec<i16> = (0..960).map(|i| ((i * 37) % 32768) as i16).collect();
    c.bench_function("rms_20ms_frame", |b| b.iter(|| rms(black_box(&samples))));
}

criterion_group!(benches, bench_protocol, bench_framer, bench_jitter, bench_meter);
criterion_main!(benches);
