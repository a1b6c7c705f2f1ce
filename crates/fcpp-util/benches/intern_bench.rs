//! Interner benchmarks: repeated identifier interning is the hot path of the
//! lexer, so both the miss path (first sight) and the hit path matter.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fcpp_util::StringTable;

fn bench_intern_miss(c: &mut Criterion) {
    c.bench_function("intern_unique_identifiers", |b| {
        b.iter_batched(
            StringTable::new,
            |mut table| {
                for i in 0..1000 {
                    black_box(table.intern(&format!("ident_{i}")));
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_intern_hit(c: &mut Criterion) {
    let mut table = StringTable::new();
    for kw in ["int", "return", "while", "template", "typename"] {
        table.intern(kw);
    }
    c.bench_function("intern_repeated_keywords", |b| {
        b.iter(|| {
            for kw in ["int", "return", "while", "template", "typename"] {
                black_box(table.intern(kw));
            }
        })
    });
}

criterion_group!(benches, bench_intern_miss, bench_intern_hit);
criterion_main!(benches);
