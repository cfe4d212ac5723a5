//! Astormer decoder: relation-aware transformer decoder over AST actions.
//!
//! Each layer runs causal self-attention biased by structural relations
//! between decoding steps, cross-attention to the encoder memory under the
//! encoder padding mask, then the feed-forward block. The stack builds the
//! causal mask and looks up the relation bias once per call, then threads
//! both through every layer unchanged.

use burn::config::Config;
use burn::module::Module;
use burn::prelude::*;

use crate::error::{self, ensure_dims, AstormerError};

use super::attention::{check_heads, AttentionMask, RelationAttention, RelationAttentionConfig};
use super::ffn::{FeedForward, FeedForwardConfig};
use super::masks::{causal_mask, relation_mask};
use super::relation::{RelationBias, RelationEmbedding, RelationEmbeddingConfig};

// ─── Configuration ────────────────────────────────────────────────

/// Decoder stack configuration, shared by the coupled and decoupled variants.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Decoder relation vocabulary size.
    pub num_relations: usize,
    /// Padding relation id.
    pub pad_relation: usize,
    #[config(default = 256)]
    pub d_model: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl DecoderConfig {
    pub(crate) fn attention(&self) -> RelationAttentionConfig {
        RelationAttentionConfig::new(self.d_model, self.n_heads).with_dropout(self.dropout)
    }

    pub(crate) fn feed_forward(&self) -> FeedForwardConfig {
        FeedForwardConfig::new(self.d_model)
    }

    /// Validate the layer count and build the shared relation table.
    pub(crate) fn init_relation<B: Backend>(
        &self,
        device: &B::Device,
    ) -> error::Result<RelationEmbedding<B>> {
        if self.num_layers == 0 {
            return Err(AstormerError::Config(
                "decoder needs at least one layer".into(),
            ));
        }
        let d_head = check_heads(self.d_model, self.n_heads)?;
        RelationEmbeddingConfig::new(self.num_relations, self.pad_relation, d_head).init(device)
    }

    /// Coupled Astormer stack.
    pub fn init_coupled<B: Backend>(&self, device: &B::Device) -> error::Result<Astormer<B>> {
        let relation = self.init_relation(device)?;
        let mut layers = Vec::with_capacity(self.num_layers);
        for _ in 0..self.num_layers {
            layers.push(AstormerLayer {
                self_attn: self.attention().init(device)?,
                cross_attn: self.attention().init(device)?,
                ffn: self.feed_forward().init(device),
            });
        }
        log::debug!(
            "built astormer decoder: {} layers, d_model {}, {} heads",
            self.num_layers,
            self.d_model,
            self.n_heads
        );
        Ok(Astormer { relation, layers })
    }
}

// ─── Relation context ─────────────────────────────────────────────

/// Relation bias and allowed mask for one self-attention block.
#[derive(Clone, Debug)]
pub struct RelationContext<B: Backend> {
    /// [batch, len, len, d_head], absent when no relation ids were given.
    pub bias: Option<RelationBias<B>>,
    /// [batch, len, len], true = may attend
    pub allowed: Tensor<B, 3, Bool>,
}

/// Look up relation ids and fold their validity into `causal`.
pub(crate) fn relation_context<B: Backend>(
    relation: &RelationEmbedding<B>,
    rel_ids: Option<Tensor<B, 3, Int>>,
    causal: Tensor<B, 3, Bool>,
    op: &'static str,
) -> error::Result<RelationContext<B>> {
    let Some(ids) = rel_ids else {
        return Ok(RelationContext {
            bias: None,
            allowed: causal,
        });
    };
    ensure_dims(op, causal.dims(), ids.dims())?;
    let bias = relation.lookup(ids.clone())?;
    let allowed = relation_mask(ids, relation.pad_index(), causal);
    Ok(RelationContext {
        bias: Some(bias),
        allowed,
    })
}

/// Stack per-layer self-attention weights into [batch, layers, heads, T, T].
pub(crate) fn stack_weights<B: Backend>(weights: Vec<Tensor<B, 4>>) -> Option<Tensor<B, 5>> {
    if weights.is_empty() {
        None
    } else {
        Some(Tensor::stack(weights, 1))
    }
}

// ─── Layer ────────────────────────────────────────────────────────

/// One coupled decoder layer.
#[derive(Module, Debug)]
pub struct AstormerLayer<B: Backend> {
    self_attn: RelationAttention<B>,
    cross_attn: RelationAttention<B>,
    ffn: FeedForward<B>,
}

impl<B: Backend> AstormerLayer<B> {
    /// - `x`: [batch, T, d_model]
    /// - `memory`: [batch, S, d_model] encoder output
    /// - `context`: relation bias and allowed mask for self-attention
    /// - `enc_mask`: [batch, S], true = real encoder position
    ///
    /// Returns the new hidden state and self-attention weights [batch, heads, T, T].
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        memory: Tensor<B, 3>,
        context: &RelationContext<B>,
        enc_mask: Option<Tensor<B, 2, Bool>>,
    ) -> error::Result<(Tensor<B, 3>, Tensor<B, 4>)> {
        let attn = self.self_attn.forward(
            x.clone(),
            x,
            context.bias.as_ref(),
            Some(AttentionMask::allowed_pairs(context.allowed.clone())),
        )?;
        let cross = self.cross_attn.forward(
            attn.context,
            memory,
            None,
            enc_mask.map(AttentionMask::allowed_keys),
        )?;
        Ok((self.ffn.forward(cross.context), attn.weights))
    }
}

// ─── Stack ────────────────────────────────────────────────────────

/// Output of a decoder stack.
#[derive(Clone, Debug)]
pub struct DecoderOutput<B: Backend> {
    /// [batch, T, d_model]
    pub hidden: Tensor<B, 3>,
    /// [batch, layers, heads, T, T], present when requested.
    pub attention: Option<Tensor<B, 5>>,
}

/// Coupled Astormer decoder stack.
#[derive(Module, Debug)]
pub struct Astormer<B: Backend> {
    relation: RelationEmbedding<B>,
    layers: Vec<AstormerLayer<B>>,
}

impl<B: Backend> Astormer<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn relation(&self) -> &RelationEmbedding<B> {
        &self.relation
    }

    /// Decode all steps in parallel under the causal mask.
    ///
    /// - `query`: [batch, T, d_model]
    /// - `memory`: [batch, S, d_model]
    /// - `rel_ids`: [batch, T, T] structural relations between steps
    /// - `enc_mask`: [batch, S], true = real encoder position
    /// - `return_attention`: also return the stacked self-attention weights
    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        memory: Tensor<B, 3>,
        rel_ids: Option<Tensor<B, 3, Int>>,
        enc_mask: Option<Tensor<B, 2, Bool>>,
        return_attention: bool,
    ) -> error::Result<DecoderOutput<B>> {
        let [batch, len, _] = query.dims();
        let causal = causal_mask::<B>(batch, len, &query.device());
        let context = relation_context(&self.relation, rel_ids, causal, "decoder relations")?;

        let mut hidden = query;
        let mut weights = Vec::new();
        for layer in &self.layers {
            let (next, layer_weights) =
                layer.forward(hidden, memory.clone(), &context, enc_mask.clone())?;
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

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    fn floats<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn random<const D: usize>(shape: [usize; D]) -> Tensor<B, D> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    fn decoder() -> Astormer<B> {
        DecoderConfig::new(6, 0)
            .with_d_model(8)
            .with_n_heads(2)
            .with_num_layers(2)
            .init_coupled(&Default::default())
            .unwrap()
    }

    #[test]
    fn output_and_attention_shapes() {
        let device = Default::default();
        let decoder = decoder();
        let ids = Tensor::<B, 3, Int>::ones([2, 3, 3], &device);
        let out = decoder
            .forward(random([2, 3, 8]), random([2, 4, 8]), Some(ids), None, true)
            .unwrap();
        assert_eq!(out.hidden.dims(), [2, 3, 8]);
        assert_eq!(out.attention.unwrap().dims(), [2, 2, 2, 3, 3]);

        let out = decoder
            .forward(random([2, 3, 8]), random([2, 4, 8]), None, None, false)
            .unwrap();
        assert!(out.attention.is_none());
    }

    #[test]
    fn attention_is_causal() {
        let device = Default::default();
        let out = decoder()
            .forward(
                random([1, 3, 8]),
                random([1, 2, 8]),
                Some(Tensor::<B, 3, Int>::ones([1, 3, 3], &device).mul_scalar(2)),
                None,
                true,
            )
            .unwrap();
        let w = floats(out.attention.unwrap());
        // [1, layers, heads, 3, 3]: strictly upper entries are zero
        for block in w.chunks(9) {
            assert_eq!(block[1], 0.0);
            assert_eq!(block[2], 0.0);
            assert_eq!(block[5], 0.0);
        }
    }

    #[test]
    fn all_padding_relations_match_no_relations() {
        let device = Default::default();
        let decoder = decoder();
        let query = random([2, 3, 8]);
        let memory = random([2, 4, 8]);
        let enc_mask = crate::model::masks::lengths_to_mask::<B>(&[4, 2], None, &device);

        let without = decoder
            .forward(query.clone(), memory.clone(), None, Some(enc_mask.clone()), true)
            .unwrap();
        let padded = decoder
            .forward(
                query,
                memory,
                Some(Tensor::zeros([2, 3, 3], &device)),
                Some(enc_mask),
                true,
            )
            .unwrap();
        assert_eq!(floats(without.hidden), floats(padded.hidden));
        assert_eq!(
            floats(without.attention.unwrap()),
            floats(padded.attention.unwrap())
        );
    }

    #[test]
    fn mismatched_inputs_are_errors() {
        let device = Default::default();
        let decoder = decoder();

        let err = decoder
            .forward(random([2, 3, 8]), random([3, 4, 8]), None, None, false)
            .unwrap_err();
        assert!(matches!(err, AstormerError::Shape { .. }));

        let ids = Tensor::<B, 3, Int>::ones([2, 3, 4], &device);
        let err = decoder
            .forward(random([2, 3, 8]), random([2, 4, 8]), Some(ids), None, false)
            .unwrap_err();
        assert!(matches!(err, AstormerError::Shape { op: "decoder relations", .. }));

        let ids = Tensor::<B, 3, Int>::ones([2, 3, 3], &device).mul_scalar(6);
        let err = decoder
            .forward(random([2, 3, 8]), random([2, 4, 8]), Some(ids), None, false)
            .unwrap_err();
        assert!(matches!(err, AstormerError::RelationOutOfRange { id: 6, vocab: 6 }));
    }

    #[test]
    fn zero_layers_is_a_config_error() {
        let result = DecoderConfig::new(6, 0)
            .with_d_model(8)
            .with_n_heads(2)
            .with_num_layers(0)
            .init_coupled::<B>(&Default::default());
        assert!(matches!(result, Err(AstormerError::Config(_))));
    }
}
