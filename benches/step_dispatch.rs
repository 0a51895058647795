//! Step dispatch throughput.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use stepflow::{AsyncSteps, Reactor};

fn sequential_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    for count in [10_usize, 100, 1000] {
        group.bench_function(format!("sequential_{count}"), |b| {
            b.iter_batched(
                || {
                    let reactor = Reactor::new();
                    let mut root = AsyncSteps::new(&reactor);
                    for _ in 0..count {
                        root.add(|_asi| Ok(()));
                    }
                    (reactor, root)
                },
                |(reactor, mut root)| {
                    root.execute();
                    reactor.run();
                    root
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn repeat_loop(c: &mut Criterion) {
    c.bench_function("repeat_1000", |b| {
        b.iter_batched(
            || {
                let reactor = Reactor::new();
                let mut root = AsyncSteps::new(&reactor);
                root.repeat(1000, |_asi, _i| Ok(()), None);
                (reactor, root)
            },
            |(reactor, mut root)| {
                root.execute();
                reactor.run();
                root
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, sequential_steps, repeat_loop);
criterion_main!(benches);
