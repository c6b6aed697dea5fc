use ndarray::{prelude::*, Zip};

use crate::nn::Float;

const SQRT_2_OVER_PI: f64 = 0.7978845608028654;
const GELU_COEF: f64 = 0.044715;

/// tanh approximation of GELU
pub fn gelu<T: Float, D: Dimension>(x: &Array<T, D>) -> (Array<T, D>, impl FnOnce(&Array<T, D>) -> Array<T, D>) {
    let k = T::cst(SQRT_2_OVER_PI);
    let c = T::cst(GELU_COEF);
    let half = T::cst(0.5);
    let y = x.mapv(|v| half * v * (T::one() + (k * (v + c * v * v * v)).tanh()));

    let x = x.clone();
    let back_fn = move |grad: &Array<T, D>| {
        let three = T::cst(3.0);
        let mut dx = x;
        Zip::from(&mut dx).and(grad).for_each(|v, g| {
            let t = (k * (*v + c * *v * *v * *v)).tanh();
            let dt = (T::one() - t * t) * k * (T::one() + three * c * *v * *v);
            *v = *g * (half * (T::one() + t) + half * *v * dt);
        });
        dx
    };
    (y, back_fn)
}

pub fn relu<T: Float, D: Dimension>(x: &mut Array<T, D>) {
    x.mapv_inplace(|v| v.max(T::zero()));
}

/// Gradient of relu given its output, since `relu(x) > 0` iff `x > 0`.
pub fn drelu<T: Float, D: Dimension>(y: &ArrayView<T, D>, grad: &mut Array<T, D>) {
    Zip::from(grad).and(y).for_each(|g, y| {
        if *y <= T::zero() {
            *g = T::zero();
        }
    });
}

/// Shrinks toward zero by `lambda`, zeroing `[-lambda, lambda]`.
pub fn softshrink<T: Float, D: Dimension>(x: &mut Array<T, D>, lambda: T) {
    x.mapv_inplace(|v| {
        if v > lambda {
            v - lambda
        } else if v < -lambda {
            v + lambda
        } else {
            T::zero()
        }
    });
}

/// Gradient of softshrink given its output.
pub fn dsoftshrink<T: Float, D: Dimension>(y: &ArrayView<T, D>, grad: &mut Array<T, D>) {
    Zip::from(grad).and(y).for_each(|g, y| {
        if *y == T::zero() {
            *g = T::zero();
        }
    });
}
