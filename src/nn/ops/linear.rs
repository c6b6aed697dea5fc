use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::utils::{channel_sum, per_channel, randn};
use crate::amp::Autocast;
use crate::nn::{Float, Param};

/// 1x1 convolution, i.e. a linear map over the channel axis of `[B, C, H, W]`.
#[derive(Clone)]
pub struct Conv1x1<T> {
    pub(crate) w: Param<T, Ix2>,
    pub(crate) bias: Option<Param<T, Ix1>>,
}

impl<T: Float> Conv1x1<T> {
    pub fn new<R: Rng>(in_dim: usize, out_dim: usize, bias: bool, rng: &mut R) -> Self
    where
        StandardNormal: Distribution<T>,
    {
        // He normal
        let std = T::cst((2.0 / in_dim.max(1) as f64).sqrt());
        Self {
            w: Param::new(randn((out_dim, in_dim), std, rng)),
            bias: if bias { Some(Param::new(Array1::zeros(out_dim))) } else { None },
        }
    }

    pub fn in_dim(&self) -> usize {
        self.w.w.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.w.w.nrows()
    }

    /// expects x to be [B, in_dim, H, W], outputs [B, out_dim, H, W]
    pub fn forward(
        &self,
        x: &Array4<T>,
        autocast: Autocast,
    ) -> (Array4<T>, impl FnOnce(&mut Self, &Array4<T>) -> Array4<T>) {
        let (b, _, h, w) = x.dim();
        let weight = autocast.cast(&self.w.w);
        let xc = autocast.cast(x);
        let mut y = Array4::zeros((b, self.out_dim(), h, w));
        for (bi, hi) in itertools::iproduct!(0..b, 0..h) {
            let rows = xc.slice(s![bi, .., hi, ..]);
            y.slice_mut(s![bi, .., hi, ..]).assign(&weight.dot(&rows));
        }
        if let Some(bias) = &self.bias {
            y += &per_channel(&bias.w);
        }
        autocast.cast_inplace(&mut y);

        let stash = autocast.stash(&xc);
        drop(xc);
        let back_fn = move |s: &mut Self, grad: &Array4<T>| {
            let x = stash.restore();
            let weight = autocast.cast(&s.w.w);
            let mut dx = Array4::zeros(x.raw_dim());
            let mut dw = Array2::zeros(s.w.w.raw_dim());
            for (bi, hi) in itertools::iproduct!(0..b, 0..h) {
                let g = grad.slice(s![bi, .., hi, ..]);
                dx.slice_mut(s![bi, .., hi, ..]).assign(&weight.t().dot(&g));
                dw += &g.dot(&x.slice(s![bi, .., hi, ..]).t());
            }
            s.w.accumulate(dw);
            if let Some(bias) = &mut s.bias {
                bias.accumulate(channel_sum(&grad.view()));
            }
            dx
        };
        (y, back_fn)
    }

    pub fn zero_grad(&mut self) {
        self.w.zero_grad();
        if let Some(b) = &mut self.bias {
            b.zero_grad();
        }
    }

    pub fn num_params(&self) -> usize {
        self.w.numel() + self.bias.as_ref().map_or(0, |b| b.numel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ops::utils::{grad_check4, randn64, rng};

    #[test]
    fn matches_channel_matmul() {
        let mut conv = Conv1x1::<f64>::new(2, 3, true, &mut rng());
        conv.bias.as_mut().unwrap().w = array![1.0, 2.0, 3.0];
        let x = randn64((2, 2, 3, 4));
        let (y, _) = conv.forward(&x, Autocast::default());
        assert_eq!(y.dim(), (2, 3, 3, 4));
        for o in 0..3 {
            let expected = conv.w.w[[o, 0]] * x[[1, 0, 2, 3]] + conv.w.w[[o, 1]] * x[[1, 1, 2, 3]] + (o + 1) as f64;
            assert!((y[[1, o, 2, 3]] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn gradcheck_input() {
        let conv = Conv1x1::<f64>::new(3, 2, true, &mut rng());
        let x = randn64((2, 3, 2, 2));
        grad_check4(
            &x,
            |x| conv.forward(x, Autocast::default()).0,
            |x, g| {
                let (_, back) = conv.forward(x, Autocast::default());
                back(&mut conv.clone(), g)
            },
        )
        .unwrap();
    }

    #[test]
    fn weight_grad_matches_finite_difference() {
        let mut conv = Conv1x1::<f64>::new(3, 2, false, &mut rng());
        let x = randn64((2, 3, 2, 2));
        let r = randn64((2, 2, 2, 2));
        let loss = |c: &Conv1x1<f64>| (c.forward(&x, Autocast::default()).0 * &r).sum();

        let (_, back) = conv.forward(&x, Autocast::default());
        back(&mut conv, &r);
        let dw = conv.w.g.clone().unwrap();

        let eps = 1e-6;
        for (o, i) in itertools::iproduct!(0..2, 0..3) {
            let mut plus = conv.clone();
            plus.w.w[[o, i]] += eps;
            let mut minus = conv.clone();
            minus.w.w[[o, i]] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((numeric - dw[[o, i]]).abs() < 1e-5, "{numeric} vs {}", dw[[o, i]]);
        }
    }

    #[test]
    fn autocast_keeps_shape_and_rounds() {
        let conv = Conv1x1::<f32>::new(4, 8, true, &mut rng());
        let x = crate::nn::ops::utils::randn((1, 4, 3, 5), 1.0f32, &mut rng());
        let (full, _) = conv.forward(&x, Autocast::new(false));
        let (half, back) = conv.forward(&x, Autocast::new(true));
        assert_eq!(full.dim(), half.dim());
        assert!(half.iter().all(|v| *v == half::f16::from_f32(*v).to_f32()));
        assert!(full.iter().zip(half.iter()).all(|(a, b)| (a - b).abs() < 0.05));
        let dx = back(&mut conv.clone(), &Array4::ones(half.raw_dim()));
        assert_eq!(dx.dim(), x.dim());
    }
}
