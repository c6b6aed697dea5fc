use anyhow::{bail, Result};
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::ops::{activations::gelu, Afno2d, Conv1x1, InstanceNorm2d};
use super::{Context, Float};
use crate::amp::Autocast;
use crate::config::BlockConfig;

const NORM_EPS: f64 = 1e-6;

/// Two pointwise convolutions around a GELU.
#[derive(Clone)]
pub struct Mlp<T: Float> {
    pub(crate) fc1: Conv1x1<T>,
    pub(crate) fc2: Conv1x1<T>,
}

impl<T: Float> Mlp<T> {
    pub fn new<R: Rng>(dim: usize, hidden: usize, rng: &mut R) -> Self
    where
        StandardNormal: Distribution<T>,
    {
        Self {
            fc1: Conv1x1::new(dim, hidden, true, rng),
            fc2: Conv1x1::new(hidden, dim, true, rng),
        }
    }

    pub fn hidden(&self) -> usize {
        self.fc1.out_dim()
    }

    pub fn forward(
        &self,
        x: &Array4<T>,
        autocast: Autocast,
    ) -> (Array4<T>, impl FnOnce(&mut Self, &Array4<T>) -> Array4<T>) {
        let (h, f1) = self.fc1.forward(x, autocast);
        let (a, f2) = gelu(&h);
        drop(h);
        let (y, f3) = self.fc2.forward(&a, autocast);

        let back_fn = move |s: &mut Self, grad: &Array4<T>| {
            let g = f3(&mut s.fc2, grad);
            let g = f2(&g);
            f1(&mut s.fc1, &g)
        };
        (y, back_fn)
    }

    pub fn zero_grad(&mut self) {
        self.fc1.zero_grad();
        self.fc2.zero_grad();
    }

    pub fn num_params(&self) -> usize {
        self.fc1.num_params() + self.fc2.num_params()
    }
}

/// One AFNO stage over `[B, dim, h, w]`:
///
/// ```text
/// r = filter(norm1(x)) + inner_skip(x) + x
/// y = mlp(norm2(r)) + r
/// ```
#[derive(Clone)]
pub struct Block<T: Float> {
    pub(crate) norm1: InstanceNorm2d<T>,
    pub(crate) filter: Afno2d<T>,
    pub(crate) inner_skip: Conv1x1<T>,
    pub(crate) norm2: InstanceNorm2d<T>,
    pub(crate) mlp: Mlp<T>,
    dim: usize,
    h: usize,
    w: usize,
}

impl<T: Float> Block<T> {
    pub fn new<R: Rng>(dim: usize, h: usize, w: usize, cfg: &BlockConfig, rng: &mut R) -> Result<Self>
    where
        StandardNormal: Distribution<T>,
    {
        if dim == 0 || h == 0 || w == 0 {
            bail!("block needs a non-empty input, got [B, {dim}, {h}, {w}]");
        }
        let hidden = (dim as f64 * cfg.mlp_ratio) as usize;
        if hidden == 0 {
            bail!("mlp ratio {} leaves no hidden channels for dim {dim}", cfg.mlp_ratio);
        }
        let filter = Afno2d::new(
            dim,
            h,
            w,
            cfg.num_blocks,
            cfg.sparsity_threshold,
            cfg.hard_thresholding_fraction,
            rng,
        )?;
        Ok(Self {
            norm1: InstanceNorm2d::new(dim, T::cst(NORM_EPS)),
            filter,
            inner_skip: Conv1x1::new(dim, dim, true, rng),
            norm2: InstanceNorm2d::new(dim, T::cst(NORM_EPS)),
            mlp: Mlp::new(dim, hidden, rng),
            dim,
            h,
            w,
        })
    }

    /// `(channels, height, width)` of the input and output
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.dim, self.h, self.w)
    }

    pub fn check_input(&self, x: &Array4<T>) -> Result<()> {
        let (_, c, h, w) = x.dim();
        if (c, h, w) != self.shape() {
            bail!(
                "block expects [B, {}, {}, {}] input, got {:?}",
                self.dim,
                self.h,
                self.w,
                x.shape()
            );
        }
        Ok(())
    }

    pub fn compile(&mut self) -> Result<()> {
        if self.filter.grid() != (self.h, self.w) || self.filter.channels() != self.dim {
            bail!(
                "spectral filter over {:?} with {} channels does not fit block {:?}",
                self.filter.grid(),
                self.filter.channels(),
                self.shape()
            );
        }
        if self.norm1.channels() != self.dim || self.norm2.channels() != self.dim {
            bail!("normalization width does not match block width {}", self.dim);
        }
        if self.inner_skip.in_dim() != self.dim || self.inner_skip.out_dim() != self.dim {
            bail!("inner skip must map {} channels onto themselves", self.dim);
        }
        self.filter.compile();
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.filter.is_compiled()
    }

    pub fn forward(
        &self,
        x: &Array4<T>,
        ctx: &Context,
    ) -> Result<(Array4<T>, impl FnOnce(&mut Self, &Array4<T>) -> Array4<T>)> {
        self.check_input(x)?;
        let autocast = ctx.autocast;

        let (h, f_norm1) = self.norm1.forward(x);
        let (h, f_filter) = self.filter.forward(&h);
        let (skip, f_skip) = self.inner_skip.forward(x, autocast);
        let residual = h + &skip + x;
        drop(skip);

        let (h, f_norm2) = self.norm2.forward(&residual);
        let (h, f_mlp) = self.mlp.forward(&h, autocast);
        let y = h + &residual;

        let back_fn = move |s: &mut Self, grad: &Array4<T>| {
            let g = f_mlp(&mut s.mlp, grad);
            let gr = f_norm2(&mut s.norm2, &g) + grad;

            let g = f_filter(&mut s.filter, &gr);
            let g = f_norm1(&mut s.norm1, &g);
            g + &f_skip(&mut s.inner_skip, &gr) + &gr
        };
        Ok((y, back_fn))
    }

    pub fn zero_grad(&mut self) {
        self.norm1.zero_grad();
        self.filter.zero_grad();
        self.inner_skip.zero_grad();
        self.norm2.zero_grad();
        self.mlp.zero_grad();
    }

    pub fn num_params(&self) -> usize {
        self.norm1.num_params()
            + self.filter.num_params()
            + self.inner_skip.num_params()
            + self.norm2.num_params()
            + self.mlp.num_params()
    }
}
