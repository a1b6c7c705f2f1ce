//! Lexer throughput on representative C++ input.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fcpp_lex::Lexer;
use fcpp_util::{FileId, StringTable};

const SAMPLE: &str = r#"
namespace geometry {
template <typename T> struct Point {
    T x, y;
    T dot(const Point& other) const { return x * other.x + y * other.y; }
};
}
int main() {
    geometry::Point<int> p{3, 4};
    int total = 0;
    for (int i = 0; i < 100; ++i) {
        total += p.dot(p) >> 1;
    }
    return total == 0 ? 1 : 0;
}
"#;

fn bench_tokenize(c: &mut Criterion) {
    c.bench_function("tokenize_sample", |b| {
        b.iter(|| {
            let mut strings = StringTable::new();
            let tokens =
                Lexer::tokenize(black_box(SAMPLE), FileId::DUMMY, &mut strings).expect("lex ok");
            black_box(tokens.len())
        })
    });
}

criterion_group!(benches, bench_tokenize);
criterion_main!(benches);
