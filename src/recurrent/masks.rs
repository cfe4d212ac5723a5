//! Dropout masks for a recurrent stack, sampled once per sequence.
//!
//! A [`RecurrentMasks`] value carries one DropConnect keep mask per layer
//! (over that layer's recurrent weights) and one locked-dropout mask per
//! layer boundary. The same value is passed to every forward call of a
//! training sequence. Inference passes `None` instead.

use burn::prelude::*;
use rand::Rng;

use crate::error::{check_probability, ensure_dims, Result};

use super::dropconnect::bernoulli_mask;

#[derive(Clone, Debug)]
pub struct RecurrentMasks<B: Backend> {
    /// Per layer, shaped like the recurrent weights. 0/1 values.
    weights: Vec<Tensor<B, 2>>,
    /// Per boundary between layers `l` and `l + 1`: [batch, 1, hidden],
    /// values `0` or `1 / (1 - p)`.
    between: Vec<Tensor<B, 3>>,
}

impl<B: Backend> RecurrentMasks<B> {
    /// Sample masks for a stack.
    ///
    /// - `recurrent`: per layer, recurrent weight shape and DropConnect probability
    /// - `dropout`: locked dropout probability between layers
    pub fn sample<R: Rng + ?Sized>(
        recurrent: &[([usize; 2], f64)],
        dropout: f64,
        batch_size: usize,
        hidden_size: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        check_probability("dropout", dropout)?;
        let mut weights = Vec::with_capacity(recurrent.len());
        for &(dims, p) in recurrent {
            check_probability("dropconnect", p)?;
            weights.push(bernoulli_mask(dims, p, 1.0, rng, device));
        }
        let scale = (1.0 / (1.0 - dropout)) as f32;
        let between = (1..recurrent.len())
            .map(|_| bernoulli_mask([batch_size, 1, hidden_size], dropout, scale, rng, device))
            .collect();
        log::trace!(
            "sampled recurrent masks: {} layers, batch {batch_size}, dropout {dropout}",
            recurrent.len()
        );
        Ok(Self { weights, between })
    }

    pub fn num_layers(&self) -> usize {
        self.weights.len()
    }

    /// Batch size of the locked masks, `None` for a single-layer stack.
    pub fn batch_size(&self) -> Option<usize> {
        self.between.first().map(|mask| mask.dims()[0])
    }

    pub fn weight_mask(&self, layer: usize) -> Option<&Tensor<B, 2>> {
        self.weights.get(layer)
    }

    /// Locked mask after `layer`, [batch, 1, hidden].
    pub fn locked_mask(&self, layer: usize) -> Option<&Tensor<B, 3>> {
        self.between.get(layer)
    }

    /// Apply the locked mask after `layer` to `x` ([batch, T, hidden]).
    ///
    /// Every time step sees the same mask. Layers without a boundary mask
    /// (the last one) pass `x` through unchanged.
    pub fn apply_between(&self, layer: usize, x: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let Some(mask) = self.between.get(layer) else {
            return Ok(x);
        };
        let [batch, len, hidden] = x.dims();
        ensure_dims("locked dropout", [batch, 1, hidden], mask.dims())?;
        Ok(x * mask.clone().expand([batch, len, hidden]))
    }

    /// Reorder the locked masks along the batch axis.
    ///
    /// Used when hypotheses are reordered between incremental calls.
    pub fn select(self, indices: Tensor<B, 1, Int>) -> Self {
        let between = self
            .between
            .into_iter()
            .map(|mask| mask.select(0, indices.clone()))
            .collect();
        Self {
            weights: self.weights,
            between,
        }
    }
}
