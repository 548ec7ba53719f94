mod datasets;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use profiledb::{
    DbConfig, HeadConfig, ProfileDb, ProfileType, SelectRequest, DEFAULT_TENANT,
};
use tempfile::TempDir;

use std::time::Duration;

fn make_config(data_dir: &std::path::Path, max_buffer_row_count: usize) -> DbConfig {
    let mut cfg = DbConfig {
        head: HeadConfig {
            data_path: data_dir.to_path_buf(),
            max_block_duration: Duration::from_secs(60 * 60),
            ..Default::default()
        },
        ..Default::default()
    };
    cfg.head.row_store.max_buffer_row_count = max_buffer_row_count;
    cfg
}

fn ingest_all(db: &ProfileDb, ops: &[datasets::IngestOp]) {
    for op in ops {
        db.ingest(&op.profile, uuid::Uuid::new_v4(), DEFAULT_TENANT, &op.labels)
            .unwrap();
    }
}

fn bench_ingest_fixed_dataset(c: &mut Criterion) {
    let ops = datasets::generate_profiles(2_000, 16, 32);

    struct Fixture {
        _dir: TempDir,
        db: ProfileDb,
    }

    let mut group = c.benchmark_group("ingest");

    for (name, rows) in [("no_cuts", 1_000_000), ("cut_every_500", 500)] {
        group.bench_function(format!("ingest_2k_{}", name), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().expect("tempdir");
                    let db = ProfileDb::open(make_config(dir.path(), rows)).expect("db init");
                    Fixture { _dir: dir, db }
                },
                |fx| {
                    for op in &ops {
                        fx.db
                            .ingest(
                                black_box(&op.profile),
                                uuid::Uuid::new_v4(),
                                DEFAULT_TENANT,
                                black_box(&op.labels),
                            )
                            .unwrap();
                    }
                    fx.db.flush().unwrap();
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

/// Half of the dataset sits in a block, the other half in the head.
fn bench_query_fixed_dataset(c: &mut Criterion) {
    let ops = datasets::generate_profiles(10_000, 64, 32);
    let (flushed, live) = ops.split_at(ops.len() / 2);

    let dir = TempDir::new().expect("tempdir");
    let db = ProfileDb::open(make_config(dir.path(), 1_000)).expect("db init");
    ingest_all(&db, flushed);
    db.flush().unwrap();
    ingest_all(&db, live);

    let cpu = ProfileType::parse("process_cpu:cpu:nanoseconds:cpu:nanoseconds").unwrap();
    let all = SelectRequest::new("", 0, i64::MAX);
    let one_job = SelectRequest::new(r#"{job="job_7"}"#, 2_000, 8_000);
    let regex = SelectRequest::new(r#"{job=~"job_1.*"}"#, 0, i64::MAX);

    let mut group = c.benchmark_group("query");
    group.bench_function("select_one_job", |b| {
        b.iter(|| {
            let _ = db.select_matching_profiles(black_box(&one_job)).unwrap();
        })
    });
    group.bench_function("merge_by_stacktraces_all", |b| {
        b.iter(|| {
            let _ = db.merge_by_stacktraces(black_box(&all)).unwrap();
        })
    });
    group.bench_function("merge_by_stacktraces_regex", |b| {
        b.iter(|| {
            let _ = db.merge_by_stacktraces(black_box(&regex)).unwrap();
        })
    });
    group.bench_function("merge_by_labels_job", |b| {
        b.iter(|| {
            let _ = db.merge_by_labels(black_box(&all), &["job"]).unwrap();
        })
    });
    let pprof = one_job.clone().with_profile_type(cpu);
    group.bench_function("merge_pprof_one_job", |b| {
        b.iter(|| {
            let _ = db.merge_pprof(black_box(&pprof)).unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_ingest_fixed_dataset, bench_query_fixed_dataset);
criterion_main!(benches);
