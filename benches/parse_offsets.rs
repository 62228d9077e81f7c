use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ktail::offset::parse_offsets;

fn benchmark_parse_offsets(c: &mut Criterion) {
    let specs = [
        ("empty", ""),
        ("all-newest", "all=newest-10:"),
        ("mixed", "0=4:,2=1:10,6"),
        (
            "dense",
            "0=oldest+10:newest-10,all=resume-5:,63=1234:5678,7",
        ),
    ];

    let mut group = c.benchmark_group("parse_offsets");
    for (name, spec) in specs {
        group.bench_with_input(BenchmarkId::from_parameter(name), &spec, |b, spec| {
            b.iter(|| parse_offsets(black_box(spec)));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_parse_offsets);
criterion_main!(benches);
