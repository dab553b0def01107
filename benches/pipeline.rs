//! Criterion benchmarks for the sample pipeline.
//!
//! Run with: cargo bench --bench pipeline
//!
//! - scan loading (read + percentile-clipped z-score) per on-disk format
//! - z-score normalization alone
//! - metadata resolution
//! - full `get` of a three-sequence sample

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mpmri::metadata::{PROSTATE_VOLUME, PSA_VALUE};
use mpmri::volume::{metaimage, nifti, DataType, Volume};
use mpmri::{
    z_score_norm, DatasetConfig, MetadataConfig, MetadataResolver, PairedVolumeDataset, RawRecord,
    SampleSource, ScanLoader, SubjectEntry,
};
use ndarray::Array3;
use tempfile::tempdir;

/// Prostate MRI volumes are typically around 20 slices of 384x384 or smaller.
const SHAPES: [(usize, usize, usize); 2] = [(20, 128, 128), (24, 384, 384)];

fn create_test_volume(shape: (usize, usize, usize)) -> Volume {
    let data = Array3::from_shape_fn(shape, |(z, y, x)| ((z * 31 + y * 7 + x) % 1024) as f32);
    Volume::new(data)
        .with_tag(PSA_VALUE, "7.4")
        .with_tag(PROSTATE_VOLUME, "45")
}

fn bench_scan_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_load");
    group.sample_size(20);
    let dir = tempdir().unwrap();
    let loader = ScanLoader::default();

    for shape in SHAPES {
        let volume = create_test_volume(shape);
        let label = format!("{}x{}x{}", shape.0, shape.1, shape.2);
        group.throughput(Throughput::Bytes((shape.0 * shape.1 * shape.2 * 2) as u64));

        for name in ["nii", "nii.gz", "mha"] {
            let path = dir.path().join(format!("{label}.{name}"));
            if name == "mha" {
                metaimage::save(&volume, &path, DataType::Int16, true).unwrap();
            } else {
                nifti::save(&volume, &path, DataType::Int16).unwrap();
            }
            group.bench_with_input(BenchmarkId::new(name, &label), &path, |b, path| {
                b.iter(|| black_box(loader.load(black_box(path)).unwrap()))
            });
        }
    }
    group.finish();
}

fn bench_z_score(c: &mut Criterion) {
    let mut group = c.benchmark_group("z_score_norm");
    group.sample_size(20);
    for shape in SHAPES {
        let data = create_test_volume(shape).into_data();
        let label = format!("{}x{}x{}", shape.0, shape.1, shape.2);
        group.bench_with_input(BenchmarkId::new("p99.5", &label), &data, |b, data| {
            b.iter(|| black_box(z_score_norm(data.clone(), Some(99.5))))
        });
        group.bench_with_input(BenchmarkId::new("unclipped", &label), &data, |b, data| {
            b.iter(|| black_box(z_score_norm(data.clone(), None)))
        });
    }
    group.finish();
}

fn bench_metadata(c: &mut Criterion) {
    let resolver = MetadataResolver::new(MetadataConfig::default()).unwrap();
    let record = RawRecord::new()
        .with(PSA_VALUE, 10.0)
        .with(PROSTATE_VOLUME, "50")
        .with("0010|1010", "066Y");
    c.bench_function("metadata_resolve", |b| {
        b.iter(|| black_box(resolver.resolve(black_box(&record))))
    });
}

fn bench_dataset_get(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let volume = create_test_volume(SHAPES[0]);
    let images = ["t2w", "adc", "hbv"].map(|name| {
        let path = dir.path().join(format!("{name}.mha"));
        metaimage::save(&volume, &path, DataType::Int16, true).unwrap();
        path
    });
    let dataset =
        PairedVolumeDataset::new(vec![SubjectEntry::new(images)], DatasetConfig::default().seed(0))
            .unwrap();

    let mut group = c.benchmark_group("dataset_get");
    group.sample_size(20);
    group.bench_function("three_sequences", |b| {
        b.iter(|| black_box(dataset.get(0).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_scan_load,
    bench_z_score,
    bench_metadata,
    bench_dataset_get
);
criterion_main!(benches);
