//! Decoupled Astormer: structural relations and action history attended
//! separately.
//!
//! Each layer chains three attention sub-blocks with independent parameters:
//! structural self-attention over the query, attention over the embeddings
//! of previously emitted actions, and cross-attention to the encoder memory.
//! Both relation id tensors are looked up in the same relation table.

use burn::module::Module;
use burn::prelude::*;

use crate::error::{ensure_dims, Result};

use super::attention::{AttentionMask, RelationAttention};
use super::decoder::{relation_context, stack_weights, DecoderConfig, DecoderOutput, RelationContext};
use super::ffn::FeedForward;
use super::masks::causal_mask;
use super::relation::RelationEmbedding;

/// One decoupled decoder layer.
#[derive(Module, Debug)]
pub struct DecoupledAstormerLayer<B: Backend> {
    self_attn: RelationAttention<B>,
    action_attn: RelationAttention<B>,
    cross_attn: RelationAttention<B>,
    ffn: FeedForward<B>,
}

impl<B: Backend> DecoupledAstormerLayer<B> {
    /// - `x`: [batch, T, d_model]
    /// - `prev`: [batch, T, d_model] previous action embeddings
    /// - `memory`: [batch, S, d_model]
    /// - `structure`, `actions`: bias + allowed mask for the two relation views
    /// - `enc_mask`: [batch, S], true = real encoder position
    ///
    /// Returns the new hidden state and the structural self-attention weights.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        prev: Tensor<B, 3>,
        memory: Tensor<B, 3>,
        structure: &RelationContext<B>,
        actions: &RelationContext<B>,
        enc_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 4>)> {
        let attn = self.self_attn.forward(
            x.clone(),
            x,
            structure.bias.as_ref(),
            Some(AttentionMask::allowed_pairs(structure.allowed.clone())),
        )?;
        let history = self.action_attn.forward(
            attn.context,
            prev,
            actions.bias.as_ref(),
            Some(AttentionMask::allowed_pairs(actions.allowed.clone())),
        )?;
        let cross = self.cross_attn.forward(
            history.context,
            memory,
            None,
            enc_mask.map(AttentionMask::allowed_keys),
        )?;
        Ok((self.ffn.forward(cross.context), attn.weights))
    }
}

impl DecoderConfig {
    /// Decoupled Astormer stack.
    pub fn init_decoupled<B: Backend>(&self, device: &B::Device) -> Result<DecoupledAstormer<B>> {
        let relation = self.init_relation(device)?;
        let mut layers = Vec::with_capacity(self.num_layers);
        for _ in 0..self.num_layers {
            layers.push(DecoupledAstormerLayer {
                self_attn: self.attention().init(device)?,
                action_attn: self.attention().init(device)?,
                cross_attn: self.attention().init(device)?,
                ffn: self.feed_forward().init(device),
            });
        }
        log::debug!(
            "built decoupled astormer decoder: {} layers, d_model {}, {} heads",
            self.num_layers,
            self.d_model,
            self.n_heads
        );
        Ok(DecoupledAstormer { relation, layers })
    }
}

/// Decoupled Astormer decoder stack.
#[derive(Module, Debug)]
pub struct DecoupledAstormer<B: Backend> {
    /// Shared by the structural and action-history lookups.
    relation: RelationEmbedding<B>,
    layers: Vec<DecoupledAstormerLayer<B>>,
}

impl<B: Backend> DecoupledAstormer<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn relation(&self) -> &RelationEmbedding<B> {
        &self.relation
    }

    /// - `query`: [batch, T, d_model]
    /// - `prev`: [batch, T, d_model]
    /// - `memory`: [batch, S, d_model]
    /// - `rel_ids`: [batch, T, T] structural relations
    /// - `action_rel_ids`: [batch, T, T] relations to previous actions
    /// - `enc_mask`: [batch, S], true = real encoder position
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        prev: Tensor<B, 3>,
        memory: Tensor<B, 3>,
        rel_ids: Option<Tensor<B, 3, Int>>,
        action_rel_ids: Option<Tensor<B, 3, Int>>,
        enc_mask: Option<Tensor<B, 2, Bool>>,
        return_attention: bool,
    ) -> Result<DecoderOutput<B>> {
        let dims = query.dims();
        ensure_dims("previous actions", dims, prev.dims())?;
        let [batch, len, _] = dims;

        let causal = causal_mask::<B>(batch, len, &query.device());
        let structure =
            relation_context(&self.relation, rel_ids, causal.clone(), "decoder relations")?;
        let actions =
            relation_context(&self.relation, action_rel_ids, causal, "action relations")?;

        let mut hidden = query;
        let mut weights = Vec::new();
        for layer in &self.layers {
            let (next, layer_weights) = layer.forward(
                hidden,
                prev.clone(),
                memory.clone(),
                &structure,
                &actions,
                enc_mask.clone(),
            )?;
            hidden = next;
            if return_attention {
                weights.push(layer_weights);
            }
        }

        Ok(DecoderOutput {
            hidden,
            attention: stack_weights(weights),
        })
    }
}
