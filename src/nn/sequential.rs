use anyhow::{bail, Result};
use ndarray::prelude::*;

use super::{Block, Context, Float};

type BlockBack<T> = Box<dyn FnOnce(&mut Block<T>, &Array4<T>) -> Array4<T>>;

/// Blocks chained in order. An empty sequence is the identity.
#[derive(Clone)]
pub struct Sequential<T: Float> {
    blocks: Vec<Block<T>>,
    compiled: bool,
}

impl<T: Float> Sequential<T> {
    pub fn new(blocks: Vec<Block<T>>) -> Self {
        Self { blocks, compiled: false }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Checks that every block feeds the next and plans all transforms up front.
    pub fn compile(&mut self) -> Result<()> {
        for (i, pair) in self.blocks.windows(2).enumerate() {
            if pair[0].shape() != pair[1].shape() {
                bail!(
                    "block {i} produces {:?} but block {} expects {:?}",
                    pair[0].shape(),
                    i + 1,
                    pair[1].shape()
                );
            }
        }
        for block in &mut self.blocks {
            block.compile()?;
        }
        self.compiled = true;
        Ok(())
    }

    pub fn forward(
        &self,
        x: &Array4<T>,
        ctx: &Context,
    ) -> Result<(Array4<T>, impl FnOnce(&mut Self, &Array4<T>) -> Array4<T>)> {
        let mut backs: Vec<BlockBack<T>> = Vec::with_capacity(self.blocks.len());
        let mut y: Option<Array4<T>> = None;
        for (i, block) in self.blocks.iter().enumerate() {
            let _range = ctx.profiler.range(&format!("block {i} forward"));
            let (next, back) = block.forward(y.as_ref().unwrap_or(x), ctx)?;
            backs.push(Box::new(back));
            y = Some(next);
        }
        let y = y.unwrap_or_else(|| x.clone());

        let profiler = ctx.profiler.clone();
        let back_fn = move |s: &mut Self, grad: &Array4<T>| {
            let mut g = grad.clone();
            for (i, (block, back)) in s.blocks.iter_mut().zip(backs).enumerate().rev() {
                let _range = profiler.range(&format!("block {i} backward"));
                g = back(block, &g);
            }
            g
        };
        Ok((y, back_fn))
    }

    /// Drops every gradient.
    pub fn zero_grad(&mut self) {
        self.blocks.iter_mut().for_each(Block::zero_grad);
    }

    pub fn num_params(&self) -> usize {
        self.blocks.iter().map(Block::num_params).sum()
    }
}
