pub mod ops;
pub mod parts;
pub mod sequential;

pub use num::complex::Complex;
pub use parts::{Block, Mlp};
pub use sequential::Sequential;

use std::fmt::Debug;
use std::ops::AddAssign;

use half::f16;
use ndarray::{prelude::*, ScalarOperand};
use num_traits::{FromPrimitive, NumAssign};
use rustfft::FftNum;

use crate::amp::Autocast;
use crate::profiler::Profiler;

pub trait Float:
    num::Float
    + FftNum
    + FromPrimitive
    + ScalarOperand
    + NumAssign
    + Debug
    + Send
    + Sync
    + 'static
{
    /// converts a constant literal
    fn cst(v: f64) -> Self;
    fn to_half(self) -> f16;
    fn from_half(h: f16) -> Self;

    /// round trip through half precision
    fn round_half(self) -> Self {
        Self::from_half(self.to_half())
    }
}

impl Float for f32 {
    fn cst(v: f64) -> Self {
        v as f32
    }
    fn to_half(self) -> f16 {
        f16::from_f32(self)
    }
    fn from_half(h: f16) -> Self {
        h.to_f32()
    }
}

impl Float for f64 {
    fn cst(v: f64) -> Self {
        v
    }
    fn to_half(self) -> f16 {
        f16::from_f64(self)
    }
    fn from_half(h: f16) -> Self {
        h.to_f64()
    }
}

/// A learnable tensor. The gradient is `None` until the first backward pass
/// after `zero_grad`, so cleared gradients hold no memory.
#[derive(Clone, Debug)]
pub struct Param<T, D: Dimension> {
    pub w: Array<T, D>,
    pub g: Option<Array<T, D>>,
}

impl<T: Clone + AddAssign, D: Dimension> Param<T, D> {
    pub fn new(w: Array<T, D>) -> Self {
        Param { w, g: None }
    }

    pub fn zero_grad(&mut self) {
        self.g = None;
    }

    pub fn accumulate(&mut self, grad: Array<T, D>) {
        match &mut self.g {
            Some(g) => *g += &grad,
            None => self.g = Some(grad),
        }
    }

    pub fn numel(&self) -> usize {
        self.w.len()
    }
}

/// Per-pass state threaded through every forward call.
#[derive(Clone, Default)]
pub struct Context {
    pub autocast: Autocast,
    pub profiler: Profiler,
}

impl Context {
    pub fn new(autocast: Autocast, profiler: Profiler) -> Self {
        Self { autocast, profiler }
    }
}
