use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::nn::Float;

/// `std * N(0, 1)` samples
pub fn randn<T, D, Sh, R>(shape: Sh, std: T, rng: &mut R) -> Array<T, D>
where
    T: Float,
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
    R: Rng,
    StandardNormal: Distribution<T>,
{
    Array::from_shape_simple_fn(shape, || std * rng.sample::<T, _>(StandardNormal))
}

/// Resamples every element from N(0, 1) in place.
pub fn normal_<T, D, R>(x: &mut Array<T, D>, rng: &mut R)
where
    T: Float,
    D: Dimension,
    R: Rng,
    StandardNormal: Distribution<T>,
{
    x.mapv_inplace(|_| rng.sample(StandardNormal));
}

/// View a per-channel vector `[C]` as `[1, C, 1, 1]`.
pub fn per_channel<T>(v: &Array1<T>) -> ArrayView4<'_, T> {
    v.view()
        .insert_axis(Axis(0))
        .insert_axis(Axis(2))
        .insert_axis(Axis(3))
}

/// View a per-plane statistic `[B, C]` as `[B, C, 1, 1]`.
pub fn per_plane<T>(v: &Array2<T>) -> ArrayView4<'_, T> {
    v.view().insert_axis(Axis(2)).insert_axis(Axis(3))
}

/// Mean over the spatial axes of `[B, C, H, W]`, giving `[B, C]`.
pub fn plane_mean<T: Float>(x: &ArrayView4<T>) -> Array2<T> {
    let (_, _, h, w) = x.dim();
    let n = T::from_usize(h * w).unwrap_or_else(T::one);
    x.sum_axis(Axis(3)).sum_axis(Axis(2)) / n
}

/// Sum over batch and spatial axes of `[B, C, H, W]`, giving `[C]`.
pub fn channel_sum<T: Float>(x: &ArrayView4<T>) -> Array1<T> {
    x.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0))
}

#[cfg(test)]
pub use gradcheck::*;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_statistics() {
        let x = Array4::from_shape_fn((2, 3, 2, 2), |(b, c, h, w)| (b * 100 + c * 10 + h * 2 + w) as f64);
        let mu = plane_mean(&x.view());
        assert_eq!(mu.dim(), (2, 3));
        assert_eq!(mu[[1, 2]], 121.5);
        let s = channel_sum(&x.view());
        assert_eq!(s.len(), 3);
        assert_eq!(s[0], (0.0 + 1.0 + 2.0 + 3.0) + (100.0 + 101.0 + 102.0 + 103.0));
        assert_eq!(per_plane(&mu).dim(), (2, 3, 1, 1));
        assert_eq!(per_channel(&s).dim(), (1, 3, 1, 1));
    }

    #[test]
    fn resample_changes_values() {
        let mut rng = rng();
        let mut x = Array2::<f32>::zeros((4, 4));
        normal_(&mut x, &mut rng);
        assert!(x.iter().any(|v| *v != 0.0));
        let y = randn::<f32, _, _, _>((4, 4), 0.0, &mut rng);
        assert!(y.iter().all(|v| *v == 0.0));
    }
}
