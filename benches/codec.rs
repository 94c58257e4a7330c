use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagecryptfs::codec::{for_each_page, PageCodec, ShiftCodec, PAGE_SIZE};
use pagecryptfs::lower::MemFs;
use pagecryptfs::stack::{StackOptions, UpperSuperblock};
use pagecryptfs::vfs::{Credentials, OpenFlags};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::ffi::OsStr;
use std::sync::Arc;

/// Generate test data of specified size
fn generate_test_data(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}

fn bench_page_codec(c: &mut Criterion) {
    let codec = ShiftCodec::default();
    let mut group = c.benchmark_group("page_codec");

    for size in [512usize, PAGE_SIZE] {
        let data = generate_test_data(size, 42);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &data, |b, data| {
            let mut buf = data.clone();
            b.iter(|| codec.encode(black_box(&mut buf)))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &data, |b, data| {
            let mut buf = data.clone();
            b.iter(|| codec.decode(black_box(&mut buf)))
        });
    }

    group.finish();
}

fn bench_whole_file(c: &mut Criterion) {
    let codec = ShiftCodec::default();
    let mut group = c.benchmark_group("whole_file");

    for size in [64 * 1024usize, 1024 * 1024] {
        let data = generate_test_data(size, 7);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            let mut buf = data.clone();
            b.iter(|| for_each_page(black_box(&mut buf), |page| codec.encode(page)))
        });
    }

    group.finish();
}

/// Cached writes and reads through the stack over an in-memory lower fs
fn bench_stacked_io(c: &mut Criterion) {
    let sb = UpperSuperblock::mount(
        MemFs::new(),
        Arc::new(ShiftCodec::default()),
        StackOptions::default(),
    )
    .expect("mount");
    let root = sb.root().expect("root");
    let cred = Credentials::current();
    let dentry = sb
        .create(&root, OsStr::new("bench"), 0o644, &cred)
        .expect("create");
    let file = sb.open(&dentry, OpenFlags::RDWR, &cred).expect("open");

    let size = 256 * 1024;
    let data = generate_test_data(size, 1);
    let mut group = c.benchmark_group("stacked_io");
    group.throughput(Throughput::Bytes(size as u64));

    group.bench_function("write", |b| {
        b.iter(|| file.write_at(0, black_box(&data)).expect("write"))
    });
    group.bench_function("read", |b| {
        b.iter(|| black_box(file.read_at(0, size).expect("read")))
    });

    group.finish();
}

criterion_group!(benches, bench_page_codec, bench_whole_file, bench_stacked_io);
criterion_main!(benches);
