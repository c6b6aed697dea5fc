use std::fmt;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tracing::{debug, info};

use crate::amp::{Autocast, GradScaler};
use crate::config::BenchConfig;
use crate::dist::{ProcessGroup, Rank};
use crate::memory::{to_gib, Device};
use crate::nn::ops::normal_;
use crate::nn::{Block, Context, Float, Sequential};
use crate::profiler::Profiler;
use crate::Config;

/// Builds `num_layers` blocks over the patched grid. Zero layers is the identity.
pub fn build_model<T: Float, R: Rng>(cfg: &BenchConfig, rng: &mut R) -> Result<Sequential<T>>
where
    StandardNormal: Distribution<T>,
{
    let (h, w) = cfg.grid()?;
    if h == 0 || w == 0 {
        bail!(
            "patch_size {} leaves an empty {h}x{w} grid for a {}x{} input",
            cfg.patch_size,
            cfg.height,
            cfg.width
        );
    }
    if cfg.embed_dim == 0 {
        bail!("embed_dim must be positive");
    }
    if cfg.block.num_blocks == 0 || cfg.embed_dim % cfg.block.num_blocks != 0 {
        bail!(
            "embed_dim {} is not divisible into {} blocks",
            cfg.embed_dim,
            cfg.block.num_blocks
        );
    }
    let blocks = (0..cfg.num_layers)
        .map(|i| {
            Block::new(cfg.embed_dim, h, w, &cfg.block, &mut *rng)
                .with_context(|| format!("failed to build block {i}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut model = Sequential::new(blocks);
    if cfg.enable_jit {
        model.compile().context("failed to compile model")?;
    }
    Ok(model)
}

/// Time per step and peak memory of one rank.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub rank: usize,
    pub ms_per_step: f64,
    pub peak_gb: f64,
    pub scaffold_peak_gb: f64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Time per step local: {} ms", self.ms_per_step)?;
        write!(f, "Memory high watermark: {} GB", self.peak_gb)
    }
}

/// Model, input and loop state owned by one rank.
pub struct Harness<T: Float> {
    pub model: Sequential<T>,
    input: Array4<T>,
    ctx: Context,
    scaler: GradScaler,
    rank: Rank,
    device: Device,
    rng: StdRng,
}

impl<T: Float> Harness<T>
where
    StandardNormal: Distribution<T>,
{
    pub fn new(cfg: &BenchConfig, rank: Rank, profiler: Profiler) -> Result<Self> {
        if cfg.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(rank.rank as u64));
        let model = build_model(cfg, &mut rng)?;
        let (h, w) = cfg.grid()?;
        let input = Array4::random_using((cfg.batch_size, cfg.embed_dim, h, w), StandardNormal, &mut rng);
        debug!(
            rank = rank.rank,
            layers = model.len(),
            params = model.num_params(),
            compiled = model.is_compiled(),
            "model built"
        );
        Ok(Self {
            model,
            input,
            ctx: Context::new(Autocast::new(cfg.enable_amp), profiler),
            scaler: GradScaler::new(cfg.enable_amp),
            device: rank.device(),
            rank,
            rng,
        })
    }

    pub fn input(&self) -> &Array4<T> {
        &self.input
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Clears gradients, runs forward and a scaled backward of `mean(output)`.
    pub fn step(&mut self) -> Result<T> {
        self.model.zero_grad();
        let (y, back) = self.model.forward(&self.input, &self.ctx)?;
        let loss = y.mean().unwrap_or_else(T::zero);
        let seed = self.scaler.scale(T::one()) / T::cst(y.len() as f64);
        let grad = Array4::from_elem(y.raw_dim(), seed);
        drop(y);
        back(&mut self.model, &grad);
        Ok(loss)
    }

    /// Resamples the input before every step.
    pub fn warmup(&mut self, steps: usize) -> Result<()> {
        for i in 0..steps {
            normal_(&mut self.input, &mut self.rng);
            let loss = self.step()?;
            debug!(rank = self.rank.rank, step = i, loss = ?loss, "warmup");
        }
        Ok(())
    }

    /// Times `steps` iterations on the current input and returns
    /// `(ms per step, peak bytes)`.
    pub fn timed(&mut self, steps: usize) -> Result<(f64, usize)> {
        if steps == 0 {
            bail!("num_steps must be positive");
        }
        let profiler = self.ctx.profiler.clone();
        self.device.synchronize();
        self.device.reset_peak_memory_stats();
        profiler.start();
        let start = Instant::now();
        for i in 0..steps {
            let _range = profiler.range(&format!("step {i}"));
            self.step()?;
        }
        if self.rank.is_initialized() {
            self.rank.barrier()?;
        }
        self.device.synchronize();
        let elapsed = start.elapsed();
        profiler.stop();
        let ms = elapsed.as_secs_f64() * 1e3 / steps as f64;
        Ok((ms, self.device.max_memory_allocated()))
    }
}

/// Warm-up and timed loop on one rank.
pub fn run_rank<T: Float>(cfg: &BenchConfig, rank: Rank) -> Result<Report>
where
    StandardNormal: Distribution<T>,
{
    let profiler = if cfg.enable_profiling {
        Profiler::load().context("failed to load profiler")?
    } else {
        Profiler::disabled()
    };
    let mut harness = Harness::<T>::new(cfg, rank.clone(), profiler)?;
    harness.warmup(cfg.num_warmup)?;

    let device = harness.device();
    device.synchronize();
    let scaffold_peak_gb = to_gib(device.max_memory_allocated());
    info!(rank = rank.rank, "Memory high watermark during scaffolding: {scaffold_peak_gb} GB");

    let (ms_per_step, peak) = harness.timed(cfg.num_steps)?;
    let report = Report { rank: rank.rank, ms_per_step, peak_gb: to_gib(peak), scaffold_peak_gb };
    if !rank.is_leader() {
        info!(rank = rank.rank, ms_per_step, peak_gb = report.peak_gb, "rank finished");
    }
    Ok(report)
}

/// Runs every rank of the configured group in `f32`. Reports are in rank order.
pub fn run(cfg: &BenchConfig) -> Result<Vec<Report>> {
    let text = cfg.config()?;
    info!(config = %text, "starting");
    let group = ProcessGroup::new(cfg.world_size)?;
    group.run(|rank| run_rank::<f32>(cfg, rank))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockConfig;

    fn small() -> BenchConfig {
        BenchConfig {
            batch_size: 2,
            embed_dim: 8,
            height: 16,
            width: 24,
            num_warmup: 1,
            num_steps: 2,
            block: BlockConfig { num_blocks: 2, ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn builder_rejects_degenerate_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let empty_grid = BenchConfig { patch_size: 32, ..small() };
        assert!(build_model::<f32, _>(&empty_grid, &mut rng).is_err());
        let no_channels = BenchConfig { embed_dim: 0, ..small() };
        assert!(build_model::<f32, _>(&no_channels, &mut rng).is_err());
        let indivisible = BenchConfig { embed_dim: 6, block: BlockConfig { num_blocks: 4, ..Default::default() }, ..small() };
        assert!(build_model::<f32, _>(&indivisible, &mut rng).is_err());
        let zero_layers = BenchConfig { num_layers: 0, patch_size: 32, ..small() };
        assert!(build_model::<f32, _>(&zero_layers, &mut rng).is_err());
    }

    #[test]
    fn builder_compiles_on_request() {
        let mut rng = StdRng::seed_from_u64(0);
        let cfg = BenchConfig { num_layers: 2, enable_jit: true, ..small() };
        let model = build_model::<f32, _>(&cfg, &mut rng).unwrap();
        assert_eq!(model.len(), 2);
        assert!(model.is_compiled());
    }

    #[test]
    fn step_fills_input_shaped_output() {
        let cfg = small();
        let mut harness = Harness::<f32>::new(&cfg, Rank::single(), Profiler::disabled()).unwrap();
        assert_eq!(harness.input().dim(), (2, 8, 4, 6));
        let loss = harness.step().unwrap();
        assert!(loss.is_finite());
    }

    #[test]
    fn identity_loss_is_input_mean() {
        let cfg = BenchConfig { num_layers: 0, ..small() };
        let mut harness = Harness::<f64>::new(&cfg, Rank::single(), Profiler::disabled()).unwrap();
        let mean = harness.input().mean().unwrap();
        assert_eq!(harness.step().unwrap(), mean);
    }

    #[test]
    fn warmup_resamples_and_timed_keeps_input() {
        let cfg = small();
        let mut harness = Harness::<f32>::new(&cfg, Rank::single(), Profiler::disabled()).unwrap();
        let before = harness.input().clone();
        harness.warmup(1).unwrap();
        let after_warmup = harness.input().clone();
        assert_ne!(before, after_warmup);
        let (ms, _) = harness.timed(2).unwrap();
        assert!(ms >= 0.0);
        assert_eq!(harness.input(), &after_warmup);
        assert!(harness.timed(0).is_err());
    }

    #[test]
    fn report_lines() {
        let report = Report { rank: 0, ms_per_step: 1.5, peak_gb: 0.25, scaffold_peak_gb: 0.5 };
        assert_eq!(report.to_string(), "Time per step local: 1.5 ms\nMemory high watermark: 0.25 GB");
    }

    #[test]
    fn run_over_two_ranks() {
        let cfg = BenchConfig { world_size: 2, enable_amp: true, ..small() };
        let reports = run(&cfg).unwrap();
        assert_eq!(reports.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![0, 1]);
        assert!(reports.iter().all(|r| r.ms_per_step >= 0.0));
    }
}
