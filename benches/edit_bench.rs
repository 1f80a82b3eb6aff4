use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use strata::{Buffer, Diff, EditOperations, Editor, Navigator};

fn sample_text(lines: usize) -> Vec<u8> {
    let mut text = Vec::new();
    for i in 0..lines {
        text.extend_from_slice(format!("{i:06}\tsome line content with e\u{301} and 中文\n").as_bytes());
    }
    text
}

fn edit_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("edit");
    group.measurement_time(Duration::from_secs(10));

    let editor = Editor::default();
    for lines in [1_000, 100_000].iter() {
        let base = Buffer::from_bytes(&editor, sample_text(*lines));

        group.bench_with_input(BenchmarkId::new("insert_middle", lines), &base, |b, base| {
            b.iter(|| {
                let mut version = base.clone();
                let at = version.len() / 2;
                version.insert(at, b"inserted").unwrap();
                black_box(version.len())
            })
        });

        group.bench_with_input(BenchmarkId::new("delete_range", lines), &base, |b, base| {
            b.iter(|| {
                let mut version = base.clone();
                let at = version.len() / 3;
                version.delete(at, at + 4096).unwrap();
                black_box(version.len())
            })
        });

        group.bench_with_input(BenchmarkId::new("read_4k", lines), &base, |b, base| {
            let mut dest = vec![0u8; 4096];
            b.iter(|| black_box(base.read(base.len() / 2, &mut dest).unwrap()))
        });
    }

    group.finish();
}

fn navigator_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("navigator");
    group.measurement_time(Duration::from_secs(10));

    let editor = Editor::default();
    let buffer = Buffer::from_bytes(&editor, sample_text(20_000));

    group.bench_function("locate_line_cold", |b| {
        b.iter(|| {
            let mut nav = Navigator::new(&buffer);
            black_box(nav.locate_line_col(10_000, 5, None).unwrap())
        })
    });

    let mut warm = Navigator::new(&buffer);
    warm.locate_byte(buffer.len(), None).unwrap();
    group.bench_function("locate_line_warm", |b| {
        b.iter(|| black_box(warm.locate_line_col(10_000, 5, None).unwrap()))
    });

    group.bench_function("derive_after_insert", |b| {
        b.iter(|| {
            let mut version = buffer.clone();
            let edit = EditOperations::insert(&mut version, buffer.len() / 2, b"x\n").unwrap();
            let nav = Navigator::derive_from(&warm, &version, &Diff::from(edit)).unwrap();
            black_box(nav.cache_sizes())
        })
    });

    group.finish();
}

criterion_group!(benches, edit_benchmark, navigator_benchmark);
criterion_main!(benches);
