//! Composite text-to-SQL model: graph encoder + structured decoder.
//!
//! The encoder and decoder kinds are resolved by name through a
//! [`Registry`] once, at construction. The result is a single `Module`
//! that can be saved and loaded as a unit.

use burn::module::Module;
use burn::prelude::*;

use crate::config::AstormerConfig;
use crate::error::{AstormerError, Result};
use crate::registry::{DecoderKind, EncoderKind, Registry};

use super::decoder::{Astormer, DecoderOutput};
use super::decoupled::DecoupledAstormer;
use super::encoder::{EncoderBatch, GraphEncoder};

/// Inputs for one decoder call. Each decoder kind reads what it needs.
#[derive(Clone, Debug)]
pub struct DecoderBatch<B: Backend> {
    /// [batch, T, d_model]
    pub query: Tensor<B, 3>,
    /// [batch, S, d_model] encoder output
    pub memory: Tensor<B, 3>,
    /// [batch, T, d_model] previous action embeddings (decoupled only)
    pub prev_actions: Option<Tensor<B, 3>>,
    /// [batch, T, T] structural relations
    pub relations: Option<Tensor<B, 3, Int>>,
    /// [batch, T, T] relations to previous actions (decoupled only)
    pub action_relations: Option<Tensor<B, 3, Int>>,
    /// [batch, S], true = real encoder position
    pub enc_mask: Option<Tensor<B, 2, Bool>>,
    pub return_attention: bool,
}

impl<B: Backend> DecoderBatch<B> {
    pub fn new(query: Tensor<B, 3>, memory: Tensor<B, 3>) -> Self {
        Self {
            query,
            memory,
            prev_actions: None,
            relations: None,
            action_relations: None,
            enc_mask: None,
            return_attention: false,
        }
    }

    pub fn with_prev_actions(mut self, prev: Tensor<B, 3>) -> Self {
        self.prev_actions = Some(prev);
        self
    }

    pub fn with_relations(mut self, relations: Tensor<B, 3, Int>) -> Self {
        self.relations = Some(relations);
        self
    }

    pub fn with_action_relations(mut self, relations: Tensor<B, 3, Int>) -> Self {
        self.action_relations = Some(relations);
        self
    }

    pub fn with_enc_mask(mut self, mask: Tensor<B, 2, Bool>) -> Self {
        self.enc_mask = Some(mask);
        self
    }

    pub fn with_attention(mut self) -> Self {
        self.return_attention = true;
        self
    }
}

/// Either decoder variant.
#[derive(Module, Debug)]
pub enum StructuredDecoder<B: Backend> {
    Astormer(Astormer<B>),
    Decoupled(DecoupledAstormer<B>),
}

impl<B: Backend> StructuredDecoder<B> {
    pub fn forward(&self, batch: DecoderBatch<B>) -> Result<DecoderOutput<B>> {
        match self {
            Self::Astormer(decoder) => {
                let unexpected = if batch.prev_actions.is_some() {
                    Some("prev_actions")
                } else if batch.action_relations.is_some() {
                    Some("action_relations")
                } else {
                    None
                };
                if let Some(input) = unexpected {
                    return Err(AstormerError::UnexpectedInput {
                        component: "astormer decoder",
                        input,
                    });
                }
                decoder.forward(
                    batch.query,
                    batch.memory,
                    batch.relations,
                    batch.enc_mask,
                    batch.return_attention,
                )
            }
            Self::Decoupled(decoder) => {
                let prev = batch.prev_actions.ok_or(AstormerError::MissingInput {
                    component: "decoupled astormer decoder",
                    input: "prev_actions",
                })?;
                decoder.forward(
                    batch.query,
                    prev,
                    batch.memory,
                    batch.relations,
                    batch.action_relations,
                    batch.enc_mask,
                    batch.return_attention,
                )
            }
        }
    }
}

/// Encoder + decoder.
#[derive(Module, Debug)]
pub struct AstormerModel<B: Backend> {
    pub encoder: GraphEncoder<B>,
    pub decoder: StructuredDecoder<B>,
}

impl AstormerConfig {
    /// Build the model, resolving `encode_method` / `decode_method` in `registry`.
    pub fn init<B: Backend>(
        &self,
        registry: &Registry,
        device: &B::Device,
    ) -> Result<AstormerModel<B>> {
        let encoder_config = self.encoder_config();
        let encoder = match registry.encoder(&self.encode_method)? {
            EncoderKind::Relational => GraphEncoder::Relational(encoder_config.init_relational(device)?),
            EncoderKind::RelationFree => {
                GraphEncoder::RelationFree(encoder_config.init_relation_free(device)?)
            }
            EncoderKind::Plain => GraphEncoder::Plain(encoder_config.init_plain(device)?),
        };

        let decoder_config = self.decoder_config();
        let decoder = match registry.decoder(&self.decode_method)? {
            DecoderKind::Astormer => StructuredDecoder::Astormer(decoder_config.init_coupled(device)?),
            DecoderKind::DecoupledAstormer => {
                StructuredDecoder::Decoupled(decoder_config.init_decoupled(device)?)
            }
        };

        log::debug!(
            "built model: encoder `{}`, decoder `{}`",
            self.encode_method,
            self.decode_method
        );
        Ok(AstormerModel { encoder, decoder })
    }
}

impl<B: Backend> AstormerModel<B> {
    /// Encode question/schema nodes. Returns [batch, nodes, d_model].
    pub fn encode(&self, batch: EncoderBatch<B>) -> Result<Tensor<B, 3>> {
        self.encoder.forward(batch)
    }

    pub fn decode(&self, batch: DecoderBatch<B>) -> Result<DecoderOutput<B>> {
        self.decoder.forward(batch)
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelationVocabConfig;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    fn config() -> AstormerConfig {
        AstormerConfig::new(RelationVocabConfig::new(10), RelationVocabConfig::new(6))
            .with_d_model(16)
            .with_n_heads(4)
            .with_encoder_layers(2)
            .with_decoder_layers(1)
            .with_dropout(0.0)
    }

    fn random<const D: usize>(shape: [usize; D]) -> Tensor<B, D> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn encode_then_decode() {
        let device = Default::default();
        let model = config().init::<B>(&Registry::with_defaults(), &device).unwrap();

        let blocked = Tensor::<B, 3, Int>::zeros([2, 5, 5], &device).equal_elem(1);
        let batch = EncoderBatch::new(random([2, 5, 16]))
            .with_relations(Tensor::ones([2, 5, 5], &device))
            .with_blocked(blocked);
        let memory = model.encode(batch).unwrap();
        assert_eq!(memory.dims(), [2, 5, 16]);

        let out = model
            .decode(
                DecoderBatch::new(random([2, 3, 16]), memory)
                    .with_relations(Tensor::ones([2, 3, 3], &device))
                    .with_attention(),
            )
            .unwrap();
        assert_eq!(out.hidden.dims(), [2, 3, 16]);
        assert_eq!(out.attention.unwrap().dims(), [2, 1, 4, 3, 3]);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let device = Default::default();
        let result = config()
            .with_encode_method("lgesql".to_string())
            .init::<B>(&Registry::with_defaults(), &device);
        assert!(matches!(
            result,
            Err(AstormerError::UnknownComponent { kind: "encoder", .. })
        ));

        let result = config().init::<B>(&Registry::new(), &device);
        assert!(result.is_err());
    }

    #[test]
    fn decoupled_decoder_requires_previous_actions() {
        let device = Default::default();
        let model = config()
            .with_decode_method("decoupled-astormer".to_string())
            .init::<B>(&Registry::with_defaults(), &device)
            .unwrap();
        let err = model
            .decode(DecoderBatch::new(random([1, 2, 16]), random([1, 4, 16])))
            .unwrap_err();
        assert!(matches!(err, AstormerError::MissingInput { input: "prev_actions", .. }));

        let out = model
            .decode(
                DecoderBatch::new(random([1, 2, 16]), random([1, 4, 16]))
                    .with_prev_actions(random([1, 2, 16])),
            )
            .unwrap();
        assert_eq!(out.hidden.dims(), [1, 2, 16]);
    }

    #[test]
    fn coupled_decoder_rejects_action_relations() {
        let device = Default::default();
        let model = config().init::<B>(&Registry::with_defaults(), &device).unwrap();
        let err = model
            .decode(
                DecoderBatch::new(random([1, 2, 16]), random([1, 4, 16]))
                    .with_action_relations(Tensor::ones([1, 2, 2], &device)),
            )
            .unwrap_err();
        assert!(matches!(err, AstormerError::UnexpectedInput { .. }));
    }

    #[test]
    fn invalid_heads_fail_at_construction() {
        let device = Default::default();
        let result = config()
            .with_n_heads(3)
            .init::<B>(&Registry::with_defaults(), &device);
        assert!(matches!(result, Err(AstormerError::Config(_))));
    }

    #[test]
    fn param_count_is_positive() {
        let device = Default::default();
        let model = config().init::<B>(&Registry::with_defaults(), &device).unwrap();
        assert!(model.num_params() > 0);
    }
}
