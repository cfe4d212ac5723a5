//! Training-mode decoding on the autodiff backend, where dropout is live.
//!
//! The ndarray backend keeps one seeded generator per process, so this file
//! holds a single test and draws every random tensor in a fixed order.

use astormer::model::masks::lengths_to_mask;
use astormer::{AstormerConfig, DecoderBatch, Registry, RelationVocabConfig};

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::Distribution;

type A = Autodiff<NdArray>;

fn floats<const D: usize>(t: Tensor<A, D>) -> Vec<f32> {
    t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

fn batch(
    method: &str,
    query: &Tensor<A, 3>,
    memory: &Tensor<A, 3>,
    enc_mask: &Tensor<A, 2, Bool>,
    relations: Option<Tensor<A, 3, Int>>,
) -> DecoderBatch<A> {
    let mut batch = DecoderBatch::new(query.clone(), memory.clone()).with_enc_mask(enc_mask.clone());
    if method == "decoupled-astormer" {
        batch = batch.with_prev_actions(query.clone());
    }
    if let Some(relations) = relations {
        batch = batch.with_relations(relations.clone());
        if method == "decoupled-astormer" {
            batch = batch.with_action_relations(relations);
        }
    }
    batch
}

#[test]
fn seeded_dropout_keeps_padding_relations_equivalent_to_none() {
    let device = Default::default();
    let registry = Registry::with_defaults();

    for method in ["astormer", "decoupled-astormer"] {
        let model = AstormerConfig::new(RelationVocabConfig::new(12), RelationVocabConfig::new(7))
            .with_d_model(8)
            .with_n_heads(2)
            .with_encoder_layers(1)
            .with_decoder_layers(2)
            .with_dropout(0.3)
            .with_decode_method(method.to_string())
            .init::<A>(&registry, &device)
            .unwrap();

        let query = Tensor::<A, 3>::random([2, 4, 8], Distribution::Normal(0.0, 1.0), &device);
        let memory = Tensor::<A, 3>::random([2, 5, 8], Distribution::Normal(0.0, 1.0), &device);
        let enc_mask = lengths_to_mask::<A>(&[5, 3], None, &device);
        let padding = Tensor::<A, 3, Int>::zeros([2, 4, 4], &device);

        A::seed(&device, 17);
        let without = model
            .decode(batch(method, &query, &memory, &enc_mask, None))
            .unwrap();
        A::seed(&device, 17);
        let padded = model
            .decode(batch(method, &query, &memory, &enc_mask, Some(padding)))
            .unwrap();
        assert_eq!(floats(without.hidden.clone()), floats(padded.hidden), "{method}");

        // a different seed draws different dropout masks
        A::seed(&device, 18);
        let reseeded = model
            .decode(batch(method, &query, &memory, &enc_mask, None))
            .unwrap();
        assert_ne!(floats(without.hidden), floats(reseeded.hidden), "{method}");
    }
}
