//! Benchmarks for bmapcopy operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use bmapcopy::{
    BlockRange, ChecksumType, ConfigBuilder, Copier, Creator, Destination, ExtentSet, ImageInput,
    Manifest, ManifestInput, ManifestOutput, MappedRange, Source,
};

fn bench_checksums(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    let data = vec![0x5Au8; 1024 * 1024];

    group.throughput(Throughput::Bytes(data.len() as u64));
    for ty in ChecksumType::ALL {
        group.bench_with_input(BenchmarkId::new("digest", ty), &data, |b, data| {
            b.iter(|| ty.digest(black_box(data)));
        });
    }

    group.finish();
}

fn sample_manifest(ranges: u64) -> Manifest {
    let ty = ChecksumType::Sha256;
    let mapped = (0..ranges)
        .map(|i| MappedRange {
            range: BlockRange::new(i * 4, i * 4 + 2),
            checksum: ty.digest(&i.to_le_bytes()),
        })
        .collect();
    Manifest::new(ranges * 4 * 4096, 4096, ty, mapped, ty.digest(b"image")).unwrap()
}

fn bench_manifest(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest");

    for ranges in [16, 256, 4096] {
        let manifest = sample_manifest(ranges);
        let xml = manifest.to_xml();

        group.bench_with_input(BenchmarkId::new("to_xml", ranges), &manifest, |b, m| {
            b.iter(|| black_box(m).to_xml());
        });
        group.bench_with_input(BenchmarkId::new("parse", ranges), &xml, |b, xml| {
            b.iter(|| Manifest::parse(black_box(xml)).unwrap());
        });
    }

    group.finish();
}

fn bench_extent_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("extent_set");

    // Adjacent single-block ranges all merge into one
    group.bench_function("push_adjacent", |b| {
        b.iter(|| {
            let mut set = ExtentSet::new(100_000);
            for i in 0..100_000 {
                set.push(BlockRange::new(i, i + 1));
            }
            black_box(set)
        });
    });

    let sparse = ExtentSet::from_ranges(
        1_000_000,
        (0..10_000u64).map(|i| BlockRange::new(i * 100, i * 100 + 10)),
    );
    group.bench_function("holes", |b| {
        b.iter(|| black_box(&sparse).holes().count());
    });

    group.finish();
}

fn bench_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy");
    group.sample_size(10);

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.img");
    let bmap = dir.path().join("image.bmap");
    let dest = dir.path().join("copy.img");

    // 64 MiB image, one MiB of data every eight
    let size = 64 * 1024 * 1024u64;
    let mut file = File::create(&image).unwrap();
    file.set_len(size).unwrap();
    let chunk = vec![0xC3u8; 1024 * 1024];
    for i in (0..64).step_by(8) {
        file.seek(SeekFrom::Start(i * 1024 * 1024)).unwrap();
        file.write_all(&chunk).unwrap();
    }
    file.sync_all().unwrap();

    let config = ConfigBuilder::new().block_size(4096).build();

    group.throughput(Throughput::Bytes(size));
    group.bench_function("create", |b| {
        let mut creator = Creator::with_config(
            ImageInput::Path(image.clone()),
            ManifestOutput::Path(bmap.clone()),
            config.clone(),
        );
        b.iter(|| creator.generate().unwrap());
    });

    let mut copier = Copier::with_config(
        Source::Path(image.clone()),
        Destination::Path(dest.clone()),
        Some(ManifestInput::Path(bmap.clone())),
        config.clone(),
    )
    .unwrap();
    group.bench_function("with_manifest", |b| {
        b.iter(|| copier.copy(true, true).unwrap());
    });

    let mut linear = Copier::with_config(
        Source::Path(image.clone()),
        Destination::Path(dest.clone()),
        None,
        config,
    )
    .unwrap();
    group.bench_function("without_manifest", |b| {
        b.iter(|| linear.copy(true, false).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_checksums,
    bench_manifest,
    bench_extent_set,
    bench_copy,
);

criterion_main!(benches);
