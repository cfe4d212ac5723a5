//! Model configuration.
//!
//! [`AstormerConfig`] carries every construction-time hyper-parameter and
//! persists as JSON through burn's `Config` trait. Encoder and decoder
//! configs are derived from it so the shared dimensions cannot disagree.

use std::path::Path;

use burn::config::Config;

use crate::error::{self, AstormerError};
use crate::model::decoder::DecoderConfig;
use crate::model::encoder::GraphEncoderConfig;

/// A relation vocabulary: its size and padding id.
#[derive(Config, Debug)]
pub struct RelationVocabConfig {
    pub size: usize,
    #[config(default = 0)]
    pub pad_index: usize,
}

/// Top-level model configuration.
#[derive(Config, Debug)]
pub struct AstormerConfig {
    /// Relations between encoder nodes.
    pub encoder_relations: RelationVocabConfig,
    /// Relations between decoding steps.
    pub decoder_relations: RelationVocabConfig,
    /// Model dimension, shared by encoder and decoder.
    #[config(default = 256)]
    pub d_model: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 8)]
    pub encoder_layers: usize,
    #[config(default = 2)]
    pub decoder_layers: usize,
    /// Dropout rate (0 for inference).
    #[config(default = 0.2)]
    pub dropout: f64,
    /// Registry name of the encoder.
    #[config(default = "String::from(\"rgatsql\")")]
    pub encode_method: String,
    /// Registry name of the decoder.
    #[config(default = "String::from(\"astormer\")")]
    pub decode_method: String,
}

impl AstormerConfig {
    /// Read a JSON config written by [`AstormerConfig::write`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> error::Result<Self> {
        let path = path.as_ref();
        Self::load(path).map_err(|err| {
            AstormerError::ConfigFile(format!("{}: {err}", path.display()))
        })
    }

    /// Write the config as JSON.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> error::Result<()> {
        let path = path.as_ref();
        self.save(path).map_err(|err| {
            AstormerError::ConfigFile(format!("{}: {err}", path.display()))
        })
    }

    pub fn encoder_config(&self) -> GraphEncoderConfig {
        GraphEncoderConfig::new(self.encoder_relations.size, self.encoder_relations.pad_index)
            .with_d_model(self.d_model)
            .with_n_heads(self.n_heads)
            .with_num_layers(self.encoder_layers)
            .with_dropout(self.dropout)
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig::new(self.decoder_relations.size, self.decoder_relations.pad_index)
            .with_d_model(self.d_model)
            .with_n_heads(self.n_heads)
            .with_num_layers(self.decoder_layers)
            .with_dropout(self.dropout)
    }
}
