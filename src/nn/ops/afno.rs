use std::sync::Arc;

use anyhow::{bail, Result};
use itertools::iproduct;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::activations::{drelu, dsoftshrink, relu, softshrink};
use super::fft::{from_parts, into_parts, to_complex, Fft2};
use super::utils::randn;
use crate::nn::{Float, Param};

const WEIGHT_SCALE: f64 = 0.02;

/// `W^T X` for complex `W: [in, out]`, `X: [in, P]` split into real and imaginary parts.
fn cmatmul_t<T: Float>(
    wr: &ArrayView2<T>,
    wi: &ArrayView2<T>,
    xr: &ArrayView2<T>,
    xi: &ArrayView2<T>,
) -> (Array2<T>, Array2<T>) {
    let re = wr.t().dot(xr) - wi.t().dot(xi);
    let im = wr.t().dot(xi) + wi.t().dot(xr);
    (re, im)
}

/// `conj(W) G`, the input gradient of `cmatmul_t`.
fn cmatmul_conj<T: Float>(
    wr: &ArrayView2<T>,
    wi: &ArrayView2<T>,
    gr: &ArrayView2<T>,
    gi: &ArrayView2<T>,
) -> (Array2<T>, Array2<T>) {
    let re = wr.dot(gr) + wi.dot(gi);
    let im = wr.dot(gi) - wi.dot(gr);
    (re, im)
}

/// `conj(X) G^T`, the weight gradient of `cmatmul_t`.
fn cgrad_weight<T: Float>(
    xr: &ArrayView2<T>,
    xi: &ArrayView2<T>,
    gr: &ArrayView2<T>,
    gi: &ArrayView2<T>,
) -> (Array2<T>, Array2<T>) {
    let re = xr.dot(&gr.t()) + xi.dot(&gi.t());
    let im = xr.dot(&gi.t()) - xi.dot(&gr.t());
    (re, im)
}

/// Number of frequencies kept along an axis of length `n`, counted from dc.
fn kept_modes(n: usize, fraction: f64) -> usize {
    ((n / 2 + 1) as f64 * fraction) as usize
}

/// Adaptive Fourier neural operator filter over `[B, C, H, W]`.
///
/// The input is taken to the frequency domain with an orthonormal 2-D FFT,
/// every frequency goes through a complex block-diagonal two-layer MLP
/// (relu on real and imaginary parts, then soft shrinkage), and the result is
/// transformed back and added to the input. Weights hold real and imaginary
/// parts along their leading axis.
#[derive(Clone)]
pub struct Afno2d<T: Float> {
    pub(crate) w1: Param<T, Ix4>,
    pub(crate) b1: Param<T, Ix3>,
    pub(crate) w2: Param<T, Ix4>,
    pub(crate) b2: Param<T, Ix3>,
    num_blocks: usize,
    block_size: usize,
    hidden: usize,
    lambda: T,
    h: usize,
    w: usize,
    kept: (usize, usize),
    plan: Option<Arc<Fft2<T>>>,
}

impl<T: Float> Afno2d<T> {
    pub fn new<R: Rng>(
        hidden_size: usize,
        h: usize,
        w: usize,
        num_blocks: usize,
        sparsity_threshold: f64,
        hard_thresholding_fraction: f64,
        rng: &mut R,
    ) -> Result<Self>
    where
        StandardNormal: Distribution<T>,
    {
        if num_blocks == 0 || hidden_size % num_blocks != 0 {
            bail!("hidden size {hidden_size} is not divisible by the number of blocks {num_blocks}");
        }
        if !(0.0..=1.0).contains(&hard_thresholding_fraction) {
            bail!("hard thresholding fraction {hard_thresholding_fraction} is outside [0, 1]");
        }
        let block_size = hidden_size / num_blocks;
        let hidden = block_size;
        let scale = T::cst(WEIGHT_SCALE);
        Ok(Self {
            w1: Param::new(randn((2, num_blocks, block_size, hidden), scale, rng)),
            b1: Param::new(randn((2, num_blocks, hidden), scale, rng)),
            w2: Param::new(randn((2, num_blocks, hidden, block_size), scale, rng)),
            b2: Param::new(randn((2, num_blocks, block_size), scale, rng)),
            num_blocks,
            block_size,
            hidden,
            lambda: T::cst(sparsity_threshold),
            h,
            w,
            kept: (kept_modes(h, hard_thresholding_fraction), kept_modes(w, hard_thresholding_fraction)),
            plan: None,
        })
    }

    pub fn grid(&self) -> (usize, usize) {
        (self.h, self.w)
    }

    pub fn channels(&self) -> usize {
        self.num_blocks * self.block_size
    }

    /// Plans the transforms once instead of on every call.
    pub fn compile(&mut self) {
        self.plan = Some(Arc::new(Fft2::plan(self.h, self.w)));
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    fn plan(&self) -> Arc<Fft2<T>> {
        match &self.plan {
            Some(plan) => plan.clone(),
            None => Arc::new(Fft2::plan(self.h, self.w)),
        }
    }

    /// 0/1 weights over `[H, W]` frequencies, `None` when every mode is kept.
    fn mask(&self) -> Option<Array2<T>> {
        let (kh, kw) = self.kept;
        let keep = |k: usize, n: usize, kept: usize| k.min(n - k) < kept;
        if (0..self.h).all(|k| keep(k, self.h, kh)) && (0..self.w).all(|k| keep(k, self.w, kw)) {
            return None;
        }
        Some(Array2::from_shape_fn((self.h, self.w), |(i, j)| {
            if keep(i, self.h, kh) && keep(j, self.w, kw) {
                T::one()
            } else {
                T::zero()
            }
        }))
    }

    pub fn forward(&self, x: &Array4<T>) -> (Array4<T>, impl FnOnce(&mut Self, &Array4<T>) -> Array4<T>) {
        let (b, _, h, _) = x.dim();
        let (nb, bs, hid) = (self.num_blocks, self.block_size, self.hidden);
        let plan = self.plan();
        let mask = self.mask();

        let mut z = to_complex(x);
        plan.forward(&mut z);
        let (xr, xi) = into_parts(&z);
        drop(z);

        let mut o1r = Array4::zeros((b, nb * hid, h, self.w));
        let mut o1i = Array4::zeros((b, nb * hid, h, self.w));
        let mut yr = Array4::zeros(x.raw_dim());
        let mut yi = Array4::zeros(x.raw_dim());
        for (bi, blk, row) in iproduct!(0..b, 0..nb, 0..h) {
            let cin = blk * bs..(blk + 1) * bs;
            let chid = blk * hid..(blk + 1) * hid;
            let w1r = self.w1.w.slice(s![0, blk, .., ..]);
            let w1i = self.w1.w.slice(s![1, blk, .., ..]);
            let w2r = self.w2.w.slice(s![0, blk, .., ..]);
            let w2i = self.w2.w.slice(s![1, blk, .., ..]);

            let (mut hr, mut hi) = cmatmul_t(
                &w1r,
                &w1i,
                &xr.slice(s![bi, cin.clone(), row, ..]),
                &xi.slice(s![bi, cin.clone(), row, ..]),
            );
            hr += &self.b1.w.slice(s![0, blk, ..]).insert_axis(Axis(1));
            hi += &self.b1.w.slice(s![1, blk, ..]).insert_axis(Axis(1));
            relu(&mut hr);
            relu(&mut hi);

            let (mut or, mut oi) = cmatmul_t(&w2r, &w2i, &hr.view(), &hi.view());
            or += &self.b2.w.slice(s![0, blk, ..]).insert_axis(Axis(1));
            oi += &self.b2.w.slice(s![1, blk, ..]).insert_axis(Axis(1));
            softshrink(&mut or, self.lambda);
            softshrink(&mut oi, self.lambda);

            o1r.slice_mut(s![bi, chid.clone(), row, ..]).assign(&hr);
            o1i.slice_mut(s![bi, chid, row, ..]).assign(&hi);
            yr.slice_mut(s![bi, cin.clone(), row, ..]).assign(&or);
            yi.slice_mut(s![bi, cin, row, ..]).assign(&oi);
        }
        if let Some(m) = &mask {
            yr *= m;
            yi *= m;
        }

        let mut out = from_parts(&yr, &yi);
        plan.inverse(&mut out);
        let y = out.mapv(|c| c.re) + x;

        let back_fn = move |s: &mut Self, grad: &Array4<T>| {
            let mut gz = to_complex(grad);
            plan.forward(&mut gz);
            let (mut gyr, mut gyi) = into_parts(&gz);
            drop(gz);
            if let Some(m) = &mask {
                gyr *= m;
                gyi *= m;
            }
            dsoftshrink(&yr.view(), &mut gyr);
            dsoftshrink(&yi.view(), &mut gyi);

            let mut gxr = Array4::zeros(gyr.raw_dim());
            let mut gxi = Array4::zeros(gyr.raw_dim());
            let mut dw1 = Array4::zeros(s.w1.w.raw_dim());
            let mut db1 = Array3::zeros(s.b1.w.raw_dim());
            let mut dw2 = Array4::zeros(s.w2.w.raw_dim());
            let mut db2 = Array3::zeros(s.b2.w.raw_dim());
            for (bi, blk, row) in iproduct!(0..b, 0..nb, 0..h) {
                let cin = blk * bs..(blk + 1) * bs;
                let chid = blk * hid..(blk + 1) * hid;
                let w1r = s.w1.w.slice(s![0, blk, .., ..]);
                let w1i = s.w1.w.slice(s![1, blk, .., ..]);
                let w2r = s.w2.w.slice(s![0, blk, .., ..]);
                let w2i = s.w2.w.slice(s![1, blk, .., ..]);
                let g2r = gyr.slice(s![bi, cin.clone(), row, ..]);
                let g2i = gyi.slice(s![bi, cin.clone(), row, ..]);
                let o1r_ = o1r.slice(s![bi, chid.clone(), row, ..]);
                let o1i_ = o1i.slice(s![bi, chid, row, ..]);

                let mut acc = db2.slice_mut(s![0, blk, ..]);
                acc += &g2r.sum_axis(Axis(1));
                let mut acc = db2.slice_mut(s![1, blk, ..]);
                acc += &g2i.sum_axis(Axis(1));
                let (dr, di) = cgrad_weight(&o1r_, &o1i_, &g2r, &g2i);
                let mut acc = dw2.slice_mut(s![0, blk, .., ..]);
                acc += &dr;
                let mut acc = dw2.slice_mut(s![1, blk, .., ..]);
                acc += &di;

                let (mut g1r, mut g1i) = cmatmul_conj(&w2r, &w2i, &g2r, &g2i);
                drelu(&o1r_, &mut g1r);
                drelu(&o1i_, &mut g1i);

                let xr_ = xr.slice(s![bi, cin.clone(), row, ..]);
                let xi_ = xi.slice(s![bi, cin.clone(), row, ..]);
                let mut acc = db1.slice_mut(s![0, blk, ..]);
                acc += &g1r.sum_axis(Axis(1));
                let mut acc = db1.slice_mut(s![1, blk, ..]);
                acc += &g1i.sum_axis(Axis(1));
                let (dr, di) = cgrad_weight(&xr_, &xi_, &g1r.view(), &g1i.view());
                let mut acc = dw1.slice_mut(s![0, blk, .., ..]);
                acc += &dr;
                let mut acc = dw1.slice_mut(s![1, blk, .., ..]);
                acc += &di;

                let (gr, gi) = cmatmul_conj(&w1r, &w1i, &g1r.view(), &g1i.view());
                gxr.slice_mut(s![bi, cin.clone(), row, ..]).assign(&gr);
                gxi.slice_mut(s![bi, cin, row, ..]).assign(&gi);
            }
            s.w1.accumulate(dw1);
            s.b1.accumulate(db1);
            s.w2.accumulate(dw2);
            s.b2.accumulate(db2);

            let mut gx = from_parts(&gxr, &gxi);
            plan.inverse(&mut gx);
            gx.mapv(|c| c.re) + grad
        };
        (y, back_fn)
    }

    pub fn zero_grad(&mut self) {
        self.w1.zero_grad();
        self.b1.zero_grad();
        self.w2.zero_grad();
        self.b2.zero_grad();
    }

    pub fn num_params(&self) -> usize {
        self.w1.numel() + self.b1.numel() + self.w2.numel() + self.b2.numel()
    }
}
