use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pbzcat::{decompress, Options};
use std::io::Write;

/// Builds a multi-block bzip2 stream in memory (no external tools).
fn build_input(uncompressed_mib: usize) -> Vec<u8> {
    let pattern: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
    let mut data = Vec::with_capacity(uncompressed_mib * 1024 * 1024);
    while data.len() < uncompressed_mib * 1024 * 1024 {
        data.extend_from_slice(&pattern);
    }
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(1));
    enc.write_all(&data).unwrap();
    enc.finish().unwrap()
}

fn bench_decode(c: &mut Criterion) {
    let input = build_input(16);

    let mut group = c.benchmark_group("bzip2_decode");
    group.throughput(Throughput::Bytes(input.len() as u64));

    for workers in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("pipeline", workers), &workers, |b, &workers| {
            b.iter(|| {
                let mut out = Vec::new();
                decompress(&input[..], &mut out, &Options { workers, slots: workers * 4 })
                    .unwrap();
                out.len()
            })
        });
    }

    group.bench_function("bzip2_crate_serial", |b| {
        b.iter(|| {
            use std::io::Read;
            let mut out = Vec::new();
            bzip2::read::BzDecoder::new(&input[..]).read_to_end(&mut out).unwrap();
            out.len()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
