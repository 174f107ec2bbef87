// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Benchmark of H.264 depacketization over a fragmented access unit.

use bytes::Bytes;
use cochlea::codec::{Depacketizer, GroupPacket, MediaSample, PacketGroup, Packetizer};
use cochlea::session::parameters::PacketizationMode;
use criterion::{criterion_group, criterion_main, Criterion};

fn fragmented_group() -> PacketGroup {
    let mut nal = vec![0x65u8];
    nal.extend((0..100_000).map(|i| (i % 251) as u8));
    let mut p = Packetizer::new("video", "h264", PacketizationMode::NonInterleaved, 1400, true)
        .unwrap();
    let chunks = p
        .packetize(&[MediaSample {
            data: Bytes::from(nal),
            marker: true,
            decoding_order: None,
        }])
        .unwrap();
    PacketGroup {
        ssrc: 1,
        timestamp: 90_000,
        packets: chunks
            .iter()
            .enumerate()
            .map(|(i, c)| GroupPacket {
                extended_sequence_number: i as u32,
                marker: c.marker,
                payload: c.data.clone(),
            })
            .collect(),
    }
}

fn depacketize(c: &mut Criterion) {
    let group = fragmented_group();
    let mut d = Depacketizer::new("video", "h264", PacketizationMode::NonInterleaved).unwrap();
    c.bench_function("depacketize_h264_fu_a", |b| {
        b.iter(|| d.depacketize(&group).unwrap())
    });
}

criterion_group!(benches, depacketize);
criterion_main!(benches);
