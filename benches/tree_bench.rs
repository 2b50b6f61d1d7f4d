use criterion::{black_box, criterion_group, criterion_main, Criterion};
use obsidian::Store;
use tempfile::NamedTempFile;

fn put_and_read(blocks: u64, payload_len: usize) {
    let tmp = NamedTempFile::new().unwrap();
    let mut store = Store::create(tmp.path(), blocks, [0u8; 32]).unwrap();
    let payload = vec![0x5Au8; payload_len];

    let mut session = store.put("bench.bin", "", [0u8; 32]);
    session.write(black_box(&payload)).unwrap();
    let token = session.finish().unwrap();

    let handle = store.open(&token).unwrap();
    let data = store.read_all(&handle).unwrap();
    black_box(data);
}

fn bench_small_file(c: &mut Criterion) {
    c.bench_function("put_read_16kb", |b| b.iter(|| put_and_read(512, 16 * 1024)));
}

fn bench_multi_leaf_file(c: &mut Criterion) {
    c.bench_function("put_read_1mb", |b| b.iter(|| put_and_read(1024, 1024 * 1024)));
}

fn bench_reducing_file(c: &mut Criterion) {
    c.bench_function("put_read_8mb", |b| b.iter(|| put_and_read(4096, 8 * 1024 * 1024)));
}

criterion_group!(benches, bench_small_file, bench_multi_leaf_file, bench_reducing_file);
criterion_main!(benches);
