//! Emulated automatic mixed precision.
//!
//! Under autocast the pointwise convolutions compute on operands rounded to
//! IEEE half precision and keep their saved activations as `f16`. Everything
//! else stays in full precision.

use half::f16;
use ndarray::prelude::*;

use crate::nn::Float;

/// Default initial loss scale, 2^16.
pub const INIT_SCALE: f64 = 65536.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Autocast {
    pub enabled: bool,
}

impl Autocast {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Rounds `x` through half precision when enabled.
    pub fn cast<T: Float, D: Dimension>(&self, x: &Array<T, D>) -> Array<T, D> {
        if self.enabled {
            x.mapv(T::round_half)
        } else {
            x.to_owned()
        }
    }

    pub fn cast_inplace<T: Float, D: Dimension>(&self, x: &mut Array<T, D>) {
        if self.enabled {
            x.mapv_inplace(T::round_half);
        }
    }

    pub fn stash<T: Float>(&self, x: &Array4<T>) -> Stash<T> {
        if self.enabled {
            Stash::Half(x.mapv(T::to_half))
        } else {
            Stash::Full(x.clone())
        }
    }
}

/// An activation saved for the backward pass.
pub enum Stash<T> {
    Full(Array4<T>),
    Half(Array4<f16>),
}

impl<T: Float> Stash<T> {
    pub fn restore(self) -> Array4<T> {
        match self {
            Stash::Full(x) => x,
            Stash::Half(x) => x.mapv(T::from_half),
        }
    }

    pub fn nbytes(&self) -> usize {
        match self {
            Stash::Full(x) => x.len() * std::mem::size_of::<T>(),
            Stash::Half(x) => x.len() * std::mem::size_of::<f16>(),
        }
    }
}

/// Loss scaling for reduced precision backward passes. There is no optimizer
/// step, so the scale never grows or backs off.
#[derive(Clone, Copy, Debug)]
pub struct GradScaler {
    scale: f64,
    enabled: bool,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        let scale = if enabled { INIT_SCALE } else { 1.0 };
        Self { scale, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale<T: Float>(&self, loss: T) -> T {
        loss * T::cst(self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_autocast_is_exact() {
        let x = array![[1.0f32 / 3.0, 1e-9], [65519.0, -2.5]];
        assert_eq!(Autocast::new(false).cast(&x), x);
    }

    #[test]
    fn enabled_autocast_rounds_to_half() {
        let x = array![1.0f32 / 3.0, 1e-9, 70000.0];
        let y = Autocast::new(true).cast(&x);
        assert_eq!(y[0], f16::from_f32(1.0 / 3.0).to_f32());
        assert_ne!(y[0], x[0]);
        assert_eq!(y[1], 0.0);
        assert!(y[2].is_infinite());
    }

    #[test]
    fn half_stash_uses_half_the_bytes() {
        let x = Array4::<f32>::ones((2, 3, 4, 5));
        let full = Autocast::new(false).stash(&x);
        let half = Autocast::new(true).stash(&x);
        assert_eq!(full.nbytes(), 2 * half.nbytes());
        assert_eq!(half.restore(), x);
    }

    #[test]
    fn scaler() {
        assert_eq!(GradScaler::new(false).scale(2.0f32), 2.0);
        assert_eq!(GradScaler::new(true).scale(2.0f32), 131072.0);
        assert!(GradScaler::new(true).is_enabled());
    }
}
