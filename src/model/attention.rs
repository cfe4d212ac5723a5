//! Relation-aware multi-head attention.
//!
//! Scores follow `q · (k + r_k) / sqrt(d_head)` and the context is
//! `Σ a · (v + r_v)`, where `r_k` / `r_v` are per-pair relation vectors
//! shared by all heads. Both relation terms are computed as additive
//! corrections to plain attention, so a zero relation vector contributes
//! exactly nothing.
//!
//! Every sub-block wraps the attention in a residual connection followed by
//! a post-LayerNorm, and applies dropout to the projection inputs.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::error::{self, check_probability, ensure_dims, shape_error, AstormerError};

use super::relation::RelationBias;

/// Score assigned to disallowed (query, key) pairs before the softmax.
pub const MASK_FILL: f32 = -1e10;

// ─── Masks ────────────────────────────────────────────────────────

/// Attention mask with its polarity fixed at construction.
#[derive(Clone, Debug)]
pub enum AttentionMask<B: Backend> {
    /// [batch, q_len, k_len], true = the pair may attend.
    Pairs(Tensor<B, 3, Bool>),
    /// [batch, k_len], true = the key is a real position.
    Keys(Tensor<B, 2, Bool>),
}

impl<B: Backend> AttentionMask<B> {
    /// Pairwise mask where `true` means "may attend".
    pub fn allowed_pairs(mask: Tensor<B, 3, Bool>) -> Self {
        Self::Pairs(mask)
    }

    /// Pairwise mask where `true` means "blocked".
    pub fn blocked_pairs(mask: Tensor<B, 3, Bool>) -> Self {
        Self::Pairs(mask.bool_not())
    }

    /// Key padding mask where `true` means "real position".
    pub fn allowed_keys(mask: Tensor<B, 2, Bool>) -> Self {
        Self::Keys(mask)
    }

    /// Expand to a [batch, q_len, k_len] allowed mask, checking its shape.
    pub fn pairwise(
        self,
        op: &'static str,
        batch: usize,
        q_len: usize,
        k_len: usize,
    ) -> error::Result<Tensor<B, 3, Bool>> {
        match self {
            Self::Pairs(mask) => {
                ensure_dims(op, [batch, q_len, k_len], mask.dims())?;
                Ok(mask)
            }
            Self::Keys(mask) => {
                ensure_dims(op, [batch, k_len], mask.dims())?;
                Ok(mask.unsqueeze_dim::<3>(1).expand([batch, q_len, k_len]))
            }
        }
    }
}

// ─── Primitive ────────────────────────────────────────────────────

/// Scaled dot-product attention with optional relation bias.
///
/// - `query`: [batch, heads, q_len, d_head]
/// - `key`, `value`: [batch, heads, k_len, d_head]
/// - `bias`: relation vectors, [batch, q_len, k_len, d_head]
/// - `allowed`: [batch, q_len, k_len], true = may attend
///
/// Returns `(context [batch, heads, q_len, d_head], weights [batch, heads, q_len, k_len])`.
///
/// A query row with no allowed key gets a uniform distribution over all keys.
pub fn scaled_dot_product<B: Backend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    bias: Option<&RelationBias<B>>,
    allowed: Option<Tensor<B, 3, Bool>>,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [batch, heads, q_len, d_head] = query.dims();
    let k_len = key.dims()[2];
    let scale = (d_head as f64).sqrt();

    let mut scores = query.clone().matmul(key.swap_dims(2, 3));
    if let Some(bias) = bias {
        // [batch, q_len, heads, d_head] x [batch, q_len, d_head, k_len]
        let relation = query
            .swap_dims(1, 2)
            .matmul(bias.key.clone().swap_dims(2, 3))
            .swap_dims(1, 2);
        scores = scores + relation;
    }
    let mut scores = scores.div_scalar(scale);

    if let Some(allowed) = allowed {
        let shape = [batch, heads, q_len, k_len];
        let allowed = allowed.unsqueeze_dim::<4>(1).expand(shape);
        let empty_rows = allowed
            .clone()
            .int()
            .sum_dim(3)
            .equal_elem(0)
            .expand(shape);
        scores = scores
            .mask_fill(allowed.bool_not(), MASK_FILL)
            .mask_fill(empty_rows, 0.0);
    }

    let weights = softmax(scores, 3);
    let mut context = weights.clone().matmul(value);
    if let Some(bias) = bias {
        let relation = weights
            .clone()
            .swap_dims(1, 2)
            .matmul(bias.value.clone())
            .swap_dims(1, 2);
        context = context + relation;
    }
    (context, weights)
}

// ─── Configuration ────────────────────────────────────────────────

/// Configuration for one attention sub-block.
#[derive(Config, Debug)]
pub struct RelationAttentionConfig {
    pub d_model: usize,
    pub n_heads: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl RelationAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<RelationAttention<B>> {
        let d_head = check_heads(self.d_model, self.n_heads)?;
        check_probability("dropout", self.dropout)?;

        let d = self.d_model;
        Ok(RelationAttention {
            query: LinearConfig::new(d, d).init(device),
            key: LinearConfig::new(d, d).with_bias(false).init(device),
            value: LinearConfig::new(d, d).with_bias(false).init(device),
            output: LinearConfig::new(d, d).init(device),
            norm: LayerNormConfig::new(d).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            n_heads: self.n_heads,
            d_head,
        })
    }
}

/// Per-head dimension, or a config error if `d_model` does not split evenly.
pub(crate) fn check_heads(d_model: usize, n_heads: usize) -> error::Result<usize> {
    if n_heads == 0 || d_model == 0 || d_model % n_heads != 0 {
        return Err(AstormerError::Config(format!(
            "d_model ({d_model}) must be a positive multiple of n_heads ({n_heads})"
        )));
    }
    Ok(d_model / n_heads)
}

// ─── Module ───────────────────────────────────────────────────────

/// Multi-head attention with relation bias, residual and post-LayerNorm.
#[derive(Module, Debug)]
pub struct RelationAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    output: Linear<B>,
    norm: LayerNorm<B>,
    dropout: Dropout,
    n_heads: usize,
    d_head: usize,
}

/// Result of one attention sub-block.
#[derive(Clone, Debug)]
pub struct AttentionOutput<B: Backend> {
    /// [batch, q_len, d_model]
    pub context: Tensor<B, 3>,
    /// [batch, heads, q_len, k_len]
    pub weights: Tensor<B, 4>,
}

impl<B: Backend> RelationAttention<B> {
    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn d_head(&self) -> usize {
        self.d_head
    }

    pub fn d_model(&self) -> usize {
        self.n_heads * self.d_head
    }

    /// Attend from `query` over `source`.
    ///
    /// - `query`: [batch, q_len, d_model], also the residual input
    /// - `source`: [batch, k_len, d_model]
    /// - `bias`: optional relation vectors, [batch, q_len, k_len, d_head]
    /// - `mask`: optional mask; `None` lets every pair attend
    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        source: Tensor<B, 3>,
        bias: Option<&RelationBias<B>>,
        mask: Option<AttentionMask<B>>,
    ) -> error::Result<AttentionOutput<B>> {
        let d_model = self.d_model();
        let [batch, q_len, q_dim] = query.dims();
        let [src_batch, k_len, src_dim] = source.dims();
        ensure_dims("attention query", [batch, q_len, d_model], [batch, q_len, q_dim])?;
        if src_batch != batch || src_dim != d_model {
            return Err(shape_error(
                "attention source",
                [batch, k_len, d_model],
                [src_batch, k_len, src_dim],
            ));
        }
        if let Some(bias) = bias {
            let expected = [batch, q_len, k_len, self.d_head];
            ensure_dims("relation key bias", expected, bias.key.dims())?;
            ensure_dims("relation value bias", expected, bias.value.dims())?;
        }
        let allowed = mask
            .map(|mask| mask.pairwise("attention mask", batch, q_len, k_len))
            .transpose()?;

        let q = self.split_heads(self.query.forward(self.dropout.forward(query.clone())));
        let k = self.split_heads(self.key.forward(self.dropout.forward(source.clone())));
        let v = self.split_heads(self.value.forward(self.dropout.forward(source)));

        let (context, weights) = scaled_dot_product(q, k, v, bias, allowed);
        let context = context.swap_dims(1, 2).reshape([batch, q_len, d_model]);
        let context = self.norm.forward(query + self.output.forward(context));

        Ok(AttentionOutput { context, weights })
    }

    /// [batch, len, d_model] → [batch, heads, len, d_head]
    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, len, _] = x.dims();
        x.reshape([batch, len, self.n_heads, self.d_head])
            .swap_dims(1, 2)
    }
}

// ─── Tests ────────────────────────────────────────────────────────
