//! Graph encoders over question tokens, tables and columns.
//!
//! The relational graph encoder (RGAT) runs N relation-aware self-attention
//! layers over every input node. Pairwise relation ids select key/value bias
//! vectors from one table shared by all layers, and a blocked-pair mask
//! (true = block) limits which nodes see each other.
//!
//! Two relation-free variants share the same entry point:
//! - [`RelationFreeGraphEncoder`]: same layer stack without relation bias.
//! - [`PlainEncoder`]: a standard transformer encoder masked by padding only.

use burn::config::Config;
use burn::module::Module;
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::prelude::*;

use crate::error::{self, check_probability, ensure_dims, AstormerError};

use super::attention::{check_heads, AttentionMask, RelationAttention, RelationAttentionConfig};
use super::ffn::{FeedForward, FeedForwardConfig};
use super::relation::{RelationBias, RelationEmbedding, RelationEmbeddingConfig};

// ─── Configuration ────────────────────────────────────────────────

/// RGAT layer configuration.
#[derive(Config, Debug)]
pub struct RgatLayerConfig {
    pub d_model: usize,
    pub n_heads: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
}

/// Graph encoder configuration, shared by every encoder kind.
#[derive(Config, Debug)]
pub struct GraphEncoderConfig {
    /// Encoder relation vocabulary size.
    pub num_relations: usize,
    /// Padding relation id.
    pub pad_relation: usize,
    #[config(default = 256)]
    pub d_model: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 8)]
    pub num_layers: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
}

// ─── RGAT Layer ───────────────────────────────────────────────────

/// Relation-aware self-attention over all nodes, then FFN.
#[derive(Module, Debug)]
pub struct RgatLayer<B: Backend> {
    attention: RelationAttention<B>,
    ffn: FeedForward<B>,
}

impl RgatLayerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<RgatLayer<B>> {
        Ok(RgatLayer {
            attention: RelationAttentionConfig::new(self.d_model, self.n_heads)
                .with_dropout(self.dropout)
                .init(device)?,
            ffn: FeedForwardConfig::new(self.d_model).init(device),
        })
    }
}

impl<B: Backend> RgatLayer<B> {
    /// - `x`: [batch, nodes, d_model]
    /// - `blocked`: [batch, nodes, nodes], true = the pair may not attend
    /// - `bias`: relation vectors, [batch, nodes, nodes, d_head]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        blocked: Tensor<B, 3, Bool>,
        bias: Option<&RelationBias<B>>,
    ) -> error::Result<Tensor<B, 3>> {
        let out = self.attention.forward(
            x.clone(),
            x,
            bias,
            Some(AttentionMask::blocked_pairs(blocked)),
        )?;
        Ok(self.ffn.forward(out.context))
    }
}

impl GraphEncoderConfig {
    fn init_layers<B: Backend>(&self, device: &B::Device) -> error::Result<Vec<RgatLayer<B>>> {
        if self.num_layers == 0 {
            return Err(AstormerError::Config(
                "graph encoder needs at least one layer".into(),
            ));
        }
        let layer = RgatLayerConfig::new(self.d_model, self.n_heads).with_dropout(self.dropout);
        (0..self.num_layers).map(|_| layer.init(device)).collect()
    }

    /// Relational graph encoder (RGAT with relation bias).
    pub fn init_relational<B: Backend>(
        &self,
        device: &B::Device,
    ) -> error::Result<RelationalGraphEncoder<B>> {
        let d_head = check_heads(self.d_model, self.n_heads)?;
        let relation =
            RelationEmbeddingConfig::new(self.num_relations, self.pad_relation, d_head).init(device)?;
        let layers = self.init_layers(device)?;
        log::debug!(
            "built relational graph encoder: {} layers, d_model {}, {} relations",
            layers.len(),
            self.d_model,
            self.num_relations
        );
        Ok(RelationalGraphEncoder { relation, layers })
    }

    /// Same stack without relation bias.
    pub fn init_relation_free<B: Backend>(
        &self,
        device: &B::Device,
    ) -> error::Result<RelationFreeGraphEncoder<B>> {
        let layers = self.init_layers(device)?;
        log::debug!(
            "built relation-free graph encoder: {} layers, d_model {}",
            layers.len(),
            self.d_model
        );
        Ok(RelationFreeGraphEncoder { layers })
    }

    /// Standard transformer encoder with a 4x feed-forward width.
    pub fn init_plain<B: Backend>(&self, device: &B::Device) -> error::Result<PlainEncoder<B>> {
        check_heads(self.d_model, self.n_heads)?;
        check_probability("dropout", self.dropout)?;
        if self.num_layers == 0 {
            return Err(AstormerError::Config(
                "plain encoder needs at least one layer".into(),
            ));
        }
        let transformer = TransformerEncoderConfig::new(
            self.d_model,
            self.d_model * 4,
            self.n_heads,
            self.num_layers,
        )
        .with_dropout(self.dropout)
        .init(device);
        log::debug!(
            "built plain transformer encoder: {} layers, d_model {}",
            self.num_layers,
            self.d_model
        );
        Ok(PlainEncoder {
            transformer,
            d_model: self.d_model,
        })
    }
}

// ─── Encoders ─────────────────────────────────────────────────────

/// RGAT encoder: one relation table, N independent layers.
#[derive(Module, Debug)]
pub struct RelationalGraphEncoder<B: Backend> {
    relation: RelationEmbedding<B>,
    layers: Vec<RgatLayer<B>>,
}

impl<B: Backend> RelationalGraphEncoder<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encode all nodes.
    ///
    /// - `inputs`: [batch, nodes, d_model]
    /// - `rel_ids`: [batch, nodes, nodes]
    /// - `blocked`: [batch, nodes, nodes], true = block
    ///
    /// The relation bias is looked up once and reused by every layer.
    pub fn forward(
        &self,
        inputs: Tensor<B, 3>,
        rel_ids: Tensor<B, 3, Int>,
        blocked: Tensor<B, 3, Bool>,
    ) -> error::Result<Tensor<B, 3>> {
        let [batch, nodes, _] = inputs.dims();
        ensure_dims("encoder relations", [batch, nodes, nodes], rel_ids.dims())?;
        let bias = self.relation.lookup(rel_ids)?;

        let mut hidden = inputs;
        for layer in &self.layers {
            hidden = layer.forward(hidden, blocked.clone(), Some(&bias))?;
        }
        Ok(hidden)
    }
}

/// RGAT layer stack without relation embeddings.
#[derive(Module, Debug)]
pub struct RelationFreeGraphEncoder<B: Backend> {
    layers: Vec<RgatLayer<B>>,
}

impl<B: Backend> RelationFreeGraphEncoder<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// - `inputs`: [batch, nodes, d_model]
    /// - `blocked`: [batch, nodes, nodes], true = block
    pub fn forward(&self, inputs: Tensor<B, 3>, blocked: Tensor<B, 3, Bool>) -> error::Result<Tensor<B, 3>> {
        let mut hidden = inputs;
        for layer in &self.layers {
            hidden = layer.forward(hidden, blocked.clone(), None)?;
        }
        Ok(hidden)
    }
}

/// Transformer encoder over the flat node sequence.
#[derive(Module, Debug)]
pub struct PlainEncoder<B: Backend> {
    transformer: TransformerEncoder<B>,
    d_model: usize,
}

impl<B: Backend> PlainEncoder<B> {
    /// - `inputs`: [batch, nodes, d_model]
    /// - `padding`: [batch, nodes], true = real position
    pub fn forward(&self, inputs: Tensor<B, 3>, padding: Tensor<B, 2, Bool>) -> error::Result<Tensor<B, 3>> {
        let [batch, nodes, d_model] = inputs.dims();
        ensure_dims("plain encoder input", [batch, nodes, self.d_model], [batch, nodes, d_model])?;
        ensure_dims("plain encoder padding", [batch, nodes], padding.dims())?;
        let input = TransformerEncoderInput::new(inputs).mask_pad(padding.bool_not());
        Ok(self.transformer.forward(input))
    }
}

// ─── Sum type ─────────────────────────────────────────────────────

/// Inputs for one encoder call. Each encoder kind reads what it needs.
#[derive(Clone, Debug)]
pub struct EncoderBatch<B: Backend> {
    /// [batch, nodes, d_model]
    pub inputs: Tensor<B, 3>,
    /// [batch, nodes, nodes] relation ids
    pub relations: Option<Tensor<B, 3, Int>>,
    /// [batch, nodes, nodes], true = pair blocked
    pub blocked: Option<Tensor<B, 3, Bool>>,
    /// [batch, nodes], true = real position
    pub padding: Option<Tensor<B, 2, Bool>>,
}

impl<B: Backend> EncoderBatch<B> {
    pub fn new(inputs: Tensor<B, 3>) -> Self {
        Self {
            inputs,
            relations: None,
            blocked: None,
            padding: None,
        }
    }

    pub fn with_relations(mut self, relations: Tensor<B, 3, Int>) -> Self {
        self.relations = Some(relations);
        self
    }

    pub fn with_blocked(mut self, blocked: Tensor<B, 3, Bool>) -> Self {
        self.blocked = Some(blocked);
        self
    }

    pub fn with_padding(mut self, padding: Tensor<B, 2, Bool>) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// Any of the encoder kinds, chosen by name through the registry.
#[derive(Module, Debug)]
pub enum GraphEncoder<B: Backend> {
    Relational(RelationalGraphEncoder<B>),
    RelationFree(RelationFreeGraphEncoder<B>),
    Plain(PlainEncoder<B>),
}

impl<B: Backend> GraphEncoder<B> {
    /// Encode a batch. Fails with [`AstormerError::MissingInput`] when the
    /// batch lacks a tensor this kind needs.
    pub fn forward(&self, batch: EncoderBatch<B>) -> error::Result<Tensor<B, 3>> {
        match self {
            Self::Relational(encoder) => {
                let relations = batch.relations.ok_or(AstormerError::MissingInput {
                    component: "relational graph encoder",
                    input: "relations",
                })?;
                let blocked = batch.blocked.ok_or(AstormerError::MissingInput {
                    component: "relational graph encoder",
                    input: "blocked",
                })?;
                encoder.forward(batch.inputs, relations, blocked)
            }
            Self::RelationFree(encoder) => {
                let blocked = batch.blocked.ok_or(AstormerError::MissingInput {
                    component: "relation-free graph encoder",
                    input: "blocked",
                })?;
                encoder.forward(batch.inputs, blocked)
            }
            Self::Plain(encoder) => {
                let padding = batch.padding.ok_or(AstormerError::MissingInput {
                    component: "plain encoder",
                    input: "padding",
                })?;
                encoder.forward(batch.inputs, padding)
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    fn config() -> GraphEncoderConfig {
        GraphEncoderConfig::new(5, 0)
            .with_d_model(8)
            .with_n_heads(2)
            .with_num_layers(2)
    }

    fn inputs(device: &<B as Backend>::Device) -> Tensor<B, 3> {
        Tensor::random([2, 4, 8], Distribution::Normal(0.0, 1.0), device)
    }

    #[test]
    fn relational_encoder_preserves_shape() {
        let device = Default::default();
        let encoder = config().init_relational::<B>(&device).unwrap();
        assert_eq!(encoder.num_layers(), 2);

        let ids = Tensor::<B, 3, Int>::ones([2, 4, 4], &device);
        let blocked = Tensor::<B, 3, Int>::zeros([2, 4, 4], &device).equal_elem(1);
        let out = encoder.forward(inputs(&device), ids, blocked).unwrap();
        assert_eq!(out.dims(), [2, 4, 8]);
    }

    #[test]
    fn blocked_nodes_do_not_leak() {
        let device = Default::default();
        let encoder = config().init_relation_free::<B>(&device).unwrap();

        // node 3 is blocked from every other node and vice versa
        let mut blocked = vec![false; 16];
        for i in 0..4 {
            if i != 3 {
                blocked[i * 4 + 3] = true;
                blocked[3 * 4 + i] = true;
            }
        }
        let blocked = Tensor::<B, 3, Bool>::from_data(TensorData::new(blocked, [1, 4, 4]), &device);

        let x = Tensor::<B, 3>::random([1, 4, 8], Distribution::Normal(0.0, 1.0), &device);
        let perturbed = x.clone().slice_assign(
            [0..1, 3..4, 0..8],
            Tensor::random([1, 1, 8], Distribution::Normal(0.0, 1.0), &device),
        );
        let a = encoder.forward(x, blocked.clone()).unwrap();
        let b = encoder.forward(perturbed, blocked).unwrap();

        let a = a.slice([0..1, 0..3, 0..8]).into_data().to_vec::<f32>().unwrap();
        let b = b.slice([0..1, 0..3, 0..8]).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sum_type_reports_missing_inputs() {
        let device = Default::default();
        let encoder = GraphEncoder::Relational(config().init_relational::<B>(&device).unwrap());
        let err = encoder.forward(EncoderBatch::new(inputs(&device))).unwrap_err();
        assert!(matches!(
            err,
            AstormerError::MissingInput { input: "relations", .. }
        ));

        let encoder = GraphEncoder::Plain(config().init_plain::<B>(&device).unwrap());
        let err = encoder.forward(EncoderBatch::new(inputs(&device))).unwrap_err();
        assert!(matches!(err, AstormerError::MissingInput { input: "padding", .. }));
    }

    #[test]
    fn plain_encoder_accepts_padding() {
        let device = Default::default();
        let encoder = GraphEncoder::Plain(config().init_plain::<B>(&device).unwrap());
        let padding = crate::model::masks::lengths_to_mask::<B>(&[4, 2], None, &device);
        let out = encoder
            .forward(EncoderBatch::new(inputs(&device)).with_padding(padding))
            .unwrap();
        assert_eq!(out.dims(), [2, 4, 8]);
    }

    #[test]
    fn zero_layers_is_a_config_error() {
        let device = Default::default();
        let result = config().with_num_layers(0).init_relational::<B>(&device);
        assert!(matches!(result, Err(AstormerError::Config(_))));
    }
}
