use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use portsweep::permute::{Permutation, PERMUTATION_KEY};

fn bench_shuffle(c: &mut Criterion) {
    let space = 1_000_000u64;
    let permutation = Permutation::new(space, PERMUTATION_KEY);

    c.bench_function("shuffle_over_1m_space", |b| {
        let mut index = 0u64;
        b.iter(|| {
            let value = permutation.shuffle(black_box(index));
            index = (index + 1) % space;
            value
        });
    });
}

criterion_group!(benches, bench_shuffle);
criterion_main!(benches);
