//! Relation-aware transformer layers for grammar-based text-to-SQL.
//!
//! - [`model`]: relation-biased multi-head attention, the relational graph
//!   encoder, and the Astormer decoder (coupled and decoupled).
//! - [`recurrent`]: LSTM and ordered-neuron LSTM stacks with DropConnect
//!   and locked dropout.
//!
//! Everything is generic over a burn `Backend`. Models are assembled from an
//! [`AstormerConfig`] and a [`Registry`] that maps encoder/decoder names to
//! the kinds this crate can build.
//!
//! ```ignore
//! use astormer::{AstormerConfig, Registry, RelationVocabConfig};
//!
//! let config = AstormerConfig::new(RelationVocabConfig::new(40), RelationVocabConfig::new(12));
//! let model = config.init::<NdArray>(&Registry::with_defaults(), &device)?;
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod recurrent;
pub mod registry;

pub use config::{AstormerConfig, RelationVocabConfig};
pub use error::{AstormerError, Result};
pub use model::composite::{AstormerModel, DecoderBatch, StructuredDecoder};
pub use model::decoder::DecoderOutput;
pub use model::encoder::{EncoderBatch, GraphEncoder};
pub use registry::{DecoderKind, EncoderKind, Registry};
