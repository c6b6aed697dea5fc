use afno_lib::bench::run;
use afno_lib::config::{BenchConfig, BlockConfig};
use afno_lib::memory::TrackingAllocator;

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;

fn config(batch_size: usize, world_size: usize) -> BenchConfig {
    BenchConfig {
        batch_size,
        world_size,
        embed_dim: 32,
        height: 64,
        width: 128,
        num_warmup: 1,
        num_steps: 2,
        block: BlockConfig { num_blocks: 4, ..Default::default() },
        ..Default::default()
    }
}

fn peaks_gb(batch_size: usize, world_size: usize) -> Vec<f64> {
    run(&config(batch_size, world_size))
        .unwrap()
        .iter()
        .map(|r| r.peak_gb)
        .collect()
}

fn close(a: f64, b: f64, rel: f64) -> bool {
    (a - b).abs() <= rel * a.max(b)
}

// one test per binary: the counters are process-wide
#[test]
fn peak_memory_scales_repeats_and_splits_by_rank() {
    let one = peaks_gb(1, 1)[0];
    let two = peaks_gb(2, 1)[0];
    let again = peaks_gb(1, 1)[0];

    assert!(one > 0.0);
    assert!(two >= one, "batch 2 peak {two} GB below batch 1 peak {one} GB");
    assert!(close(one, again, 0.05), "{one} GB then {again} GB");

    // every rank owns a model of the same size, so each sees about one rank's worth
    let per_rank = peaks_gb(1, 4);
    assert_eq!(per_rank.len(), 4);
    for (rank, peak) in per_rank.iter().enumerate() {
        assert!(close(one, *peak, 0.2), "rank {rank} peak {peak} GB vs single rank {one} GB");
    }
}
