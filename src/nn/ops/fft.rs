use std::sync::Arc;

use ndarray::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::nn::{Complex, Float};

/// Orthonormal 2-D FFT over the last two axes of `[B, C, H, W]`.
pub struct Fft2<T: Float> {
    h: usize,
    w: usize,
    fwd_h: Arc<dyn Fft<T>>,
    inv_h: Arc<dyn Fft<T>>,
    fwd_w: Arc<dyn Fft<T>>,
    inv_w: Arc<dyn Fft<T>>,
}

impl<T: Float> Fft2<T> {
    pub fn plan(h: usize, w: usize) -> Self {
        let mut planner = FftPlanner::<T>::new();
        Self {
            h,
            w,
            fwd_h: planner.plan_fft_forward(h),
            inv_h: planner.plan_fft_inverse(h),
            fwd_w: planner.plan_fft_forward(w),
            inv_w: planner.plan_fft_inverse(w),
        }
    }

    pub fn forward(&self, x: &mut Array4<Complex<T>>) {
        self.process(x, false);
    }

    pub fn inverse(&self, x: &mut Array4<Complex<T>>) {
        self.process(x, true);
    }

    fn process(&self, x: &mut Array4<Complex<T>>, inverse: bool) {
        let (_, _, h, w) = x.dim();
        debug_assert_eq!((h, w), (self.h, self.w));
        let (fh, fw) = if inverse {
            (&self.inv_h, &self.inv_w)
        } else {
            (&self.fwd_h, &self.fwd_w)
        };
        let scale = T::one() / T::from_usize(h * w).unwrap_or_else(T::one).sqrt();
        let zero = Complex::new(T::zero(), T::zero());
        let scratch_len = fh.get_inplace_scratch_len().max(fw.get_inplace_scratch_len());
        let mut scratch = vec![zero; scratch_len];
        let mut line = vec![zero; h.max(w)];

        for mut batch in x.outer_iter_mut() {
            for mut img in batch.outer_iter_mut() {
                for mut row in img.rows_mut() {
                    let buf = &mut line[..w];
                    buf.iter_mut().zip(row.iter()).for_each(|(b, v)| *b = *v);
                    fw.process_with_scratch(buf, &mut scratch);
                    row.iter_mut().zip(buf.iter()).for_each(|(v, b)| *v = *b);
                }
                for mut col in img.columns_mut() {
                    let buf = &mut line[..h];
                    buf.iter_mut().zip(col.iter()).for_each(|(b, v)| *b = *v);
                    fh.process_with_scratch(buf, &mut scratch);
                    col.iter_mut().zip(buf.iter()).for_each(|(v, b)| *v = *b * scale);
                }
            }
        }
    }
}

pub fn to_complex<T: Float>(x: &Array4<T>) -> Array4<Complex<T>> {
    x.mapv(|v| Complex::new(v, T::zero()))
}

pub fn from_parts<T: Float>(re: &Array4<T>, im: &Array4<T>) -> Array4<Complex<T>> {
    let mut out = Array4::from_elem(re.raw_dim(), Complex::new(T::zero(), T::zero()));
    ndarray::Zip::from(&mut out).and(re).and(im).for_each(|o, r, i| *o = Complex::new(*r, *i));
    out
}

pub fn into_parts<T: Float>(x: &Array4<Complex<T>>) -> (Array4<T>, Array4<T>) {
    (x.mapv(|c| c.re), x.mapv(|c| c.im))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ops::utils::randn64;

    #[test]
    fn roundtrip_is_identity() {
        let x = randn64((2, 3, 4, 6));
        let plan = Fft2::<f64>::plan(4, 6);
        let mut z = to_complex(&x);
        plan.forward(&mut z);
        plan.inverse(&mut z);
        let (re, im) = into_parts(&z);
        assert!(re.iter().zip(x.iter()).all(|(a, b)| (a - b).abs() < 1e-12));
        assert!(im.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn orthonormal_preserves_energy() {
        let x = randn64((1, 2, 5, 3));
        let plan = Fft2::<f64>::plan(5, 3);
        let mut z = to_complex(&x);
        plan.forward(&mut z);
        let energy_x: f64 = x.iter().map(|v| v * v).sum();
        let energy_z: f64 = z.iter().map(|c| c.norm_sqr()).sum();
        assert!((energy_x - energy_z).abs() < 1e-9);
        // the dc term of each plane is sum / sqrt(hw)
        let dc = x.slice(s![0, 1, .., ..]).sum() / 15f64.sqrt();
        assert!((z[[0, 1, 0, 0]].re - dc).abs() < 1e-12);
    }

    #[test]
    fn parts() {
        let re = randn64((1, 1, 2, 2));
        let im = randn64((1, 1, 2, 2)) * 2.0;
        let (r, i) = into_parts(&from_parts(&re, &im));
        assert_eq!(r, re);
        assert_eq!(i, im);
    }
}
