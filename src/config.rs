use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::Config;

/// Hyper-parameters shared by every block of the model.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct BlockConfig {
    #[derivative(Default(value = "8"))]
    pub num_blocks: usize,
    #[derivative(Default(value = "4.0"))]
    pub mlp_ratio: f64,
    #[derivative(Default(value = "0.01"))]
    pub sparsity_threshold: f64,
    #[derivative(Default(value = "1.0"))]
    pub hard_thresholding_fraction: f64,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct BenchConfig {
    #[derivative(Default(value = "1"))]
    pub batch_size: usize,
    #[derivative(Default(value = "1"))]
    pub num_layers: usize,
    #[derivative(Default(value = "4"))]
    pub patch_size: usize,
    #[derivative(Default(value = "1024"))]
    pub embed_dim: usize,
    #[derivative(Default(value = "720"))]
    pub height: usize,
    #[derivative(Default(value = "1440"))]
    pub width: usize,
    pub enable_amp: bool,
    pub enable_jit: bool,
    pub enable_profiling: bool,
    #[derivative(Default(value = "10"))]
    pub num_warmup: usize,
    #[derivative(Default(value = "10"))]
    pub num_steps: usize,
    #[derivative(Default(value = "333"))]
    pub seed: u64,
    #[derivative(Default(value = "1"))]
    pub world_size: usize,
    pub block: BlockConfig,
}

impl BenchConfig {
    /// Spatial size of the patched input.
    pub fn grid(&self) -> Result<(usize, usize)> {
        if self.patch_size == 0 {
            bail!("patch_size must be positive");
        }
        Ok((self.height / self.patch_size, self.width / self.patch_size))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut cfg = Self::default();
        cfg.load_config(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(cfg)
    }
}

/// Command line. Flags left unset fall back to `--config`, then to the defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "afno-bench", about = "Forward/backward latency and peak memory of AFNO blocks")]
pub struct Args {
    /// RON file holding a BenchConfig
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long = "batch_size")]
    pub batch_size: Option<usize>,
    #[arg(long = "num_layers")]
    pub num_layers: Option<usize>,
    #[arg(long = "patch_size")]
    pub patch_size: Option<usize>,
    #[arg(long = "embed_dim")]
    pub embed_dim: Option<usize>,
    #[arg(long)]
    pub height: Option<usize>,
    #[arg(long)]
    pub width: Option<usize>,
    /// run pointwise convolutions in half precision
    #[arg(long = "enable_amp")]
    pub enable_amp: bool,
    /// plan every block before the warm-up
    #[arg(long = "enable_jit")]
    pub enable_jit: bool,
    /// bracket the timed loop with profiler start/stop and ranges
    #[arg(long = "enable_profiling")]
    pub enable_profiling: bool,
    #[arg(long = "num_warmup")]
    pub num_warmup: Option<usize>,
    #[arg(long = "num_steps")]
    pub num_steps: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long = "world_size")]
    pub world_size: Option<usize>,
}

impl Args {
    pub fn resolve(self) -> Result<BenchConfig> {
        let mut cfg = match &self.config {
            Some(path) => BenchConfig::from_file(path)?,
            None => BenchConfig::default(),
        };
        macro_rules! set {
            ($args:ident, $cfg:ident; $($field:ident),*) => {
                $(if let Some(v) = $args.$field { $cfg.$field = v; })*
            };
        }
        let args = self;
        set!(args, cfg; batch_size, num_layers, patch_size, embed_dim, height, width, num_warmup, num_steps, seed, world_size);
        cfg.enable_amp |= args.enable_amp;
        cfg.enable_jit |= args.enable_jit;
        cfg.enable_profiling |= args.enable_profiling;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Args::default().resolve().unwrap();
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.num_layers, 1);
        assert_eq!(cfg.embed_dim, 1024);
        assert_eq!(cfg.grid().unwrap(), (180, 360));
        assert!(!cfg.enable_amp && !cfg.enable_jit && !cfg.enable_profiling);
        assert_eq!((cfg.num_warmup, cfg.num_steps, cfg.world_size), (10, 10, 1));
        assert_eq!(cfg.block.num_blocks, 8);
        assert_eq!(cfg.block.mlp_ratio, 4.0);
    }

    #[test]
    fn parse_flags() {
        let args = Args::try_parse_from([
            "afno-bench",
            "--batch_size",
            "2",
            "--num_layers",
            "3",
            "--enable_amp",
            "--enable_jit",
        ])
        .unwrap();
        let cfg = args.resolve().unwrap();
        assert_eq!((cfg.batch_size, cfg.num_layers), (2, 3));
        assert!(cfg.enable_amp && cfg.enable_jit && !cfg.enable_profiling);
        assert_eq!(cfg.patch_size, 4);
    }

    #[test]
    fn invalid_int_is_rejected() {
        assert!(Args::try_parse_from(["afno-bench", "--batch_size", "two"]).is_err());
        assert!(Args::try_parse_from(["afno-bench", "--height", "-3"]).is_err());
    }

    #[test]
    fn zero_patch() {
        let cfg = BenchConfig { patch_size: 0, ..Default::default() };
        assert!(cfg.grid().is_err());
        let cfg = BenchConfig { patch_size: 1000, ..Default::default() };
        assert_eq!(cfg.grid().unwrap(), (0, 1));
    }

    #[test]
    fn file_then_flags() {
        let path = std::env::temp_dir().join(format!("afno-bench-{}.ron", std::process::id()));
        std::fs::write(&path, "(embed_dim: 64, num_layers: 4, block: (num_blocks: 4))").unwrap();
        let args = Args::try_parse_from([
            "afno-bench",
            "--config",
            path.to_str().unwrap(),
            "--num_layers",
            "2",
        ])
        .unwrap();
        let cfg = args.resolve().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.embed_dim, 64);
        assert_eq!(cfg.num_layers, 2);
        assert_eq!(cfg.block.num_blocks, 4);
        assert_eq!(cfg.block.mlp_ratio, 4.0);
        assert_eq!(cfg.height, 720);
    }

    #[test]
    fn malformed_file() {
        let path = std::env::temp_dir().join(format!("afno-bench-bad-{}.ron", std::process::id()));
        std::fs::write(&path, "(embed_dim: \"wide\")").unwrap();
        let err = BenchConfig::from_file(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(format!("{err:#}").contains("failed to parse config"));
        assert!(BenchConfig::from_file(Path::new("/nonexistent/afno.ron")).is_err());
    }

    #[test]
    fn config_roundtrip_through_ron() {
        let cfg = BenchConfig { batch_size: 7, enable_jit: true, ..Default::default() };
        let mut back = BenchConfig::default();
        back.load_config(&cfg.config().unwrap()).unwrap();
        assert_eq!(back.batch_size, 7);
        assert!(back.enable_jit);
    }
}
