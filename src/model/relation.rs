//! Relation embeddings: learned key/value bias vectors per relation id.
//!
//! One table of `[num_relations, d_head]` for keys and one for values.
//! The padding relation row is zero at construction and is multiplied by
//! zero again on every lookup, so it stays exactly zero under training.

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::ElementConversion;

use crate::error::{self, AstormerError};

/// Relation embedding configuration.
#[derive(Config, Debug)]
pub struct RelationEmbeddingConfig {
    /// Size of the relation vocabulary, padding included.
    pub num_relations: usize,
    /// Id of the padding relation.
    pub pad_index: usize,
    /// Per-head dimension (`d_model / n_heads`).
    pub d_head: usize,
    #[config(default = "Initializer::Normal{mean:0.0, std:1.0}")]
    pub initializer: Initializer,
}

/// Key and value bias tables.
#[derive(Module, Debug)]
pub struct RelationEmbedding<B: Backend> {
    key: Param<Tensor<B, 2>>,
    value: Param<Tensor<B, 2>>,
    num_relations: usize,
    pad_index: usize,
}

/// Looked-up relation biases for one batch.
///
/// Both tensors are [batch, q_len, k_len, d_head] and shared across heads.
#[derive(Clone, Debug)]
pub struct RelationBias<B: Backend> {
    pub key: Tensor<B, 4>,
    pub value: Tensor<B, 4>,
}

impl RelationEmbeddingConfig {
    /// Initialize both tables with a zeroed padding row.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<RelationEmbedding<B>> {
        if self.num_relations == 0 || self.pad_index >= self.num_relations {
            return Err(AstormerError::Config(format!(
                "padding relation {} outside a vocabulary of {} relations",
                self.pad_index, self.num_relations
            )));
        }
        let keep = padding_keep::<B>(self.num_relations, self.pad_index, self.d_head, device);
        let key = self
            .initializer
            .init::<B, 2, _>([self.num_relations, self.d_head], device)
            .val()
            * keep.clone();
        let value = self
            .initializer
            .init::<B, 2, _>([self.num_relations, self.d_head], device)
            .val()
            * keep;

        Ok(RelationEmbedding {
            key: Param::from_tensor(key),
            value: Param::from_tensor(value),
            num_relations: self.num_relations,
            pad_index: self.pad_index,
        })
    }
}

impl<B: Backend> RelationEmbedding<B> {
    pub fn num_relations(&self) -> usize {
        self.num_relations
    }

    pub fn pad_index(&self) -> usize {
        self.pad_index
    }

    pub fn d_head(&self) -> usize {
        self.key.dims()[1]
    }

    /// Look up key/value biases for every (query, key) pair.
    ///
    /// - `rel_ids`: [batch, q_len, k_len]
    ///
    /// Returns biases of shape [batch, q_len, k_len, d_head]. Fails if any
    /// id falls outside the vocabulary.
    pub fn lookup(&self, rel_ids: Tensor<B, 3, Int>) -> error::Result<RelationBias<B>> {
        self.check_range(&rel_ids)?;

        let [batch, q_len, k_len] = rel_ids.dims();
        let d_head = self.d_head();
        let device = rel_ids.device();
        let flat: Tensor<B, 1, Int> = rel_ids.reshape([batch * q_len * k_len]);
        let keep = padding_keep::<B>(self.num_relations, self.pad_index, d_head, &device);

        let key = (self.key.val() * keep.clone())
            .select(0, flat.clone())
            .reshape([batch, q_len, k_len, d_head]);
        let value = (self.value.val() * keep)
            .select(0, flat)
            .reshape([batch, q_len, k_len, d_head]);

        Ok(RelationBias { key, value })
    }

    fn check_range(&self, rel_ids: &Tensor<B, 3, Int>) -> error::Result<()> {
        if rel_ids.dims().iter().product::<usize>() == 0 {
            return Ok(());
        }
        let min: i64 = rel_ids.clone().min().into_scalar().elem();
        if min < 0 {
            return Err(AstormerError::RelationOutOfRange {
                id: min,
                vocab: self.num_relations,
            });
        }
        let max: i64 = rel_ids.clone().max().into_scalar().elem();
        if max as usize >= self.num_relations {
            return Err(AstormerError::RelationOutOfRange {
                id: max,
                vocab: self.num_relations,
            });
        }
        Ok(())
    }
}

/// [num_relations, d_head] of ones with the padding row zeroed.
fn padding_keep<B: Backend>(
    num_relations: usize,
    pad_index: usize,
    d_head: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    Tensor::<B, 1, Int>::arange(0..num_relations as i64, device)
        .not_equal_elem(pad_index as i64)
        .float()
        .unsqueeze_dim::<2>(1)
        .expand([num_relations, d_head])
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn floats<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    #[test]
    fn padding_row_is_zero() {
        let device = Default::default();
        let table = RelationEmbeddingConfig::new(5, 2, 4).init::<B>(&device).unwrap();

        let ids = Tensor::<B, 3, Int>::from_data(
            TensorData::new(vec![2i64, 2, 1, 2], [1, 2, 2]),
            &device,
        );
        let bias = table.lookup(ids).unwrap();
        assert_eq!(bias.key.dims(), [1, 2, 2, 4]);

        let key = floats(bias.key);
        let value = floats(bias.value);
        // pairs (0,0), (0,1), (1,1) are padding
        for pair in [0usize, 1, 3] {
            assert!(key[pair * 4..pair * 4 + 4].iter().all(|&v| v == 0.0));
            assert!(value[pair * 4..pair * 4 + 4].iter().all(|&v| v == 0.0));
        }
        assert!(key[8..12].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let device = Default::default();
        let table = RelationEmbeddingConfig::new(3, 0, 2).init::<B>(&device).unwrap();
        let ids = Tensor::<B, 3, Int>::from_data(
            TensorData::new(vec![0i64, 1, 3, 2], [1, 2, 2]),
            &device,
        );
        match table.lookup(ids) {
            Err(AstormerError::RelationOutOfRange { id, vocab }) => {
                assert_eq!(id, 3);
                assert_eq!(vocab, 3);
            }
            other => panic!("expected out-of-range error, got {other:?}"),
        }
    }

    #[test]
    fn pad_index_must_be_in_vocabulary() {
        let device = Default::default();
        let result = RelationEmbeddingConfig::new(3, 3, 2).init::<B>(&device);
        assert!(matches!(result, Err(AstormerError::Config(_))));
    }
}
