use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use tiffmend::codec::{Codec, DeflateCodec, LzwCodec};
use tiffmend::diagnose::sample_stats;
use tiffmend::format::PixelType;
use tiffmend::source::SampleData;
use tiffmend::writer::{TiffWriter, WriteConfig};

fn bench_classification(c: &mut Criterion) {
    let mut data = vec![0u16; 2048 * 2048];
    for (i, v) in data.iter_mut().enumerate() {
        if i % 7 == 0 {
            *v = 900;
        }
    }
    let samples = SampleData::U16(data);

    c.bench_function("sample_stats_4m_u16", |b| b.iter(|| sample_stats(black_box(&samples))));
}

fn bench_tile_codecs(c: &mut Criterion) {
    let tile = vec![42u8; 512 * 512 * 2];
    let lzw = LzwCodec;
    let deflate = DeflateCodec;

    c.bench_function("lzw_encode_512_tile", |b| b.iter(|| lzw.encode(black_box(&tile))));
    c.bench_function("deflate_encode_512_tile", |b| b.iter(|| deflate.encode(black_box(&tile))));
}

fn bench_append_plane(c: &mut Criterion) {
    let raw = vec![0u8; 1024 * 1024 * 2];
    let config = WriteConfig::default();

    c.bench_function("append_1024_u16_plane_lzw", |b| {
        b.iter(|| {
            let mut writer = TiffWriter::new(Cursor::new(Vec::new()), false).unwrap();
            writer
                .append_plane(black_box(&raw), (1024, 1024), PixelType::U16, None, &config)
                .unwrap();
            writer.finalize().unwrap();
        })
    });
}

criterion_group!(benches, bench_classification, bench_tile_codecs, bench_append_plane);
criterion_main!(benches);
