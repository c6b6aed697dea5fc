use criterion::{black_box, criterion_group, criterion_main, Criterion};

use afno_lib::amp::Autocast;
use afno_lib::config::BlockConfig;
use afno_lib::nn::ops::randn;
use afno_lib::nn::{Block, Context, Sequential};
use afno_lib::profiler::Profiler;
use rand::{rngs::StdRng, SeedableRng};

pub fn block_step(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(333);
    let cfg = BlockConfig::default();
    let (dim, h, w) = (64, 32, 64);
    let block = Block::<f32>::new(dim, h, w, &cfg, &mut rng).unwrap();
    let x = randn((2, dim, h, w), 1.0f32, &mut rng);
    let g = randn((2, dim, h, w), 1.0f32, &mut rng);

    let eager = Sequential::new(vec![block.clone()]);
    let mut compiled = eager.clone();
    compiled.compile().unwrap();

    for (name, model, amp) in [
        ("block eager", eager.clone(), false),
        ("block compiled", compiled, false),
        ("block eager amp", eager, true),
    ] {
        let mut model = model;
        let ctx = Context::new(Autocast::new(amp), Profiler::disabled());
        c.bench_function(name, |b| {
            b.iter(|| {
                model.zero_grad();
                let (y, back) = model.forward(black_box(&x), &ctx).unwrap();
                black_box(back(&mut model, &g));
                y
            })
        });
    }
}

criterion_group!(benches, block_step);
criterion_main!(benches);
