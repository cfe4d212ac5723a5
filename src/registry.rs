//! Name → component-kind registry for encoders and decoders.
//!
//! Configurations refer to encoders and decoders by name (`"rgatsql"`,
//! `"astormer"`, ...). A [`Registry`] maps those names to the closed set of
//! kinds this crate can build. Nothing is registered implicitly:
//! [`Registry::with_defaults`] performs the standard registrations.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{AstormerError, Result};

/// Encoder kinds this crate can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    /// Relational graph attention with relation bias.
    Relational,
    /// Graph attention without relation bias.
    RelationFree,
    /// Standard transformer encoder masked by padding.
    Plain,
}

/// Decoder kinds this crate can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderKind {
    Astormer,
    DecoupledAstormer,
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Relational => "relational graph encoder",
            Self::RelationFree => "relation-free graph encoder",
            Self::Plain => "plain encoder",
        };
        f.write_str(name)
    }
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Astormer => "astormer decoder",
            Self::DecoupledAstormer => "decoupled astormer decoder",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Registry {
    encoders: BTreeMap<String, EncoderKind>,
    decoders: BTreeMap<String, DecoderKind>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard names.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let encoders = [
            ("rgatsql", EncoderKind::Relational),
            ("irnet", EncoderKind::RelationFree),
            ("none", EncoderKind::Plain),
        ];
        let decoders = [
            ("astormer", DecoderKind::Astormer),
            ("decoupled-astormer", DecoderKind::DecoupledAstormer),
        ];
        for (name, kind) in encoders {
            if let Err(err) = registry.register_encoder(name, kind) {
                log::warn!("skipping default: {err}");
            }
        }
        for (name, kind) in decoders {
            if let Err(err) = registry.register_decoder(name, kind) {
                log::warn!("skipping default: {err}");
            }
        }
        registry
    }

    pub fn register_encoder(&mut self, name: &str, kind: EncoderKind) -> Result<()> {
        if self.encoders.contains_key(name) {
            return Err(AstormerError::DuplicateComponent {
                kind: "encoder",
                name: name.to_string(),
            });
        }
        log::debug!("registered encoder `{name}` as {kind}");
        self.encoders.insert(name.to_string(), kind);
        Ok(())
    }

    pub fn register_decoder(&mut self, name: &str, kind: DecoderKind) -> Result<()> {
        if self.decoders.contains_key(name) {
            return Err(AstormerError::DuplicateComponent {
                kind: "decoder",
                name: name.to_string(),
            });
        }
        log::debug!("registered decoder `{name}` as {kind}");
        self.decoders.insert(name.to_string(), kind);
        Ok(())
    }

    pub fn encoder(&self, name: &str) -> Result<EncoderKind> {
        self.encoders
            .get(name)
            .copied()
            .ok_or_else(|| AstormerError::UnknownComponent {
                kind: "encoder",
                name: name.to_string(),
            })
    }

    pub fn decoder(&self, name: &str) -> Result<DecoderKind> {
        self.decoders
            .get(name)
            .copied()
            .ok_or_else(|| AstormerError::UnknownComponent {
                kind: "decoder",
                name: name.to_string(),
            })
    }

    /// Registered encoder names, sorted.
    pub fn encoder_names(&self) -> Vec<&str> {
        self.encoders.keys().map(String::as_str).collect()
    }

    /// Registered decoder names, sorted.
    pub fn decoder_names(&self) -> Vec<&str> {
        self.decoders.keys().map(String::as_str).collect()
    }
}
