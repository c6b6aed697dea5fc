use ndarray::prelude::*;

use super::utils::{channel_sum, per_channel, per_plane, plane_mean};
use crate::nn::{Float, Param};

/// Saved state of a parameter-free instance normalization.
pub struct InstanceNormCtx<T> {
    xhat: Array4<T>,
    inv_sd: Array2<T>,
}

impl<T> InstanceNormCtx<T> {
    /// The normalized input.
    pub fn output(&self) -> &Array4<T> {
        &self.xhat
    }
}

/// Normalizes every `[H, W]` plane of `[B, C, H, W]` to zero mean and unit
/// (biased) variance.
pub fn instancenorm2d<T: Float>(x: &Array4<T>, eps: T) -> InstanceNormCtx<T> {
    let mu = plane_mean(&x.view());
    let ci = x - &per_plane(&mu);
    let var = plane_mean(&(&ci * &ci).view());
    let inv_sd = var.mapv_into(|v| (v + eps).sqrt().recip());
    let xhat = ci * &per_plane(&inv_sd);
    InstanceNormCtx { xhat, inv_sd }
}

pub fn dinstancenorm2d<T: Float>(ctx: &InstanceNormCtx<T>, grad: &Array4<T>) -> Array4<T> {
    let m1 = plane_mean(&grad.view());
    let m2 = plane_mean(&(grad * &ctx.xhat).view());
    let centered = grad - &per_plane(&m1) - &ctx.xhat * &per_plane(&m2);
    centered * &per_plane(&ctx.inv_sd)
}

/// Affine instance norm without running statistics, `[B, C, H, W]` layout.
#[derive(Clone)]
pub struct InstanceNorm2d<T> {
    pub(crate) gamma: Param<T, Ix1>,
    pub(crate) beta: Param<T, Ix1>,
    eps: T,
}

impl<T: Float> InstanceNorm2d<T> {
    pub fn new(channels: usize, eps: T) -> Self {
        Self {
            gamma: Param::new(Array1::ones(channels)),
            beta: Param::new(Array1::zeros(channels)),
            eps,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.w.len()
    }

    pub fn forward(&self, x: &Array4<T>) -> (Array4<T>, impl FnOnce(&mut Self, &Array4<T>) -> Array4<T>) {
        let ctx = instancenorm2d(x, self.eps);
        let out = &ctx.xhat * &per_channel(&self.gamma.w) + &per_channel(&self.beta.w);
        let back_fn = move |s: &mut Self, grad: &Array4<T>| {
            s.beta.accumulate(channel_sum(&grad.view()));
            s.gamma.accumulate(channel_sum(&(grad * &ctx.xhat).view()));
            dinstancenorm2d(&ctx, &(grad * &per_channel(&s.gamma.w)))
        };
        (out, back_fn)
    }

    pub fn zero_grad(&mut self) {
        self.gamma.zero_grad();
        self.beta.zero_grad();
    }

    pub fn num_params(&self) -> usize {
        self.gamma.numel() + self.beta.numel()
    }
}
