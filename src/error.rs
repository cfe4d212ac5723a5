//! Error type shared by every layer in the crate.
//!
//! Construction problems (`Config`) are fatal and surface from `init`.
//! Everything else is raised at call time when tensors disagree with the
//! contract of the layer they are fed to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AstormerError {
    /// Invalid hyper-parameters, detected when a layer is built.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A tensor handed to `op` does not have the shape the op requires.
    #[error("shape mismatch in {op}: expected {expected}, got {actual}")]
    Shape {
        op: &'static str,
        expected: String,
        actual: String,
    },

    /// A relation id outside `[0, vocab)`.
    #[error("relation id {id} out of range for a vocabulary of {vocab} relations")]
    RelationOutOfRange { id: i64, vocab: usize },

    /// A component variant was called without an input it cannot work without.
    #[error("{component} requires `{input}`")]
    MissingInput {
        component: &'static str,
        input: &'static str,
    },

    /// A component variant was handed an input it has no use for.
    #[error("{component} does not take `{input}`")]
    UnexpectedInput {
        component: &'static str,
        input: &'static str,
    },

    #[error("unknown {kind} `{name}`")]
    UnknownComponent { kind: &'static str, name: String },

    #[error("{kind} `{name}` is already registered")]
    DuplicateComponent { kind: &'static str, name: String },

    /// Reading a persisted configuration failed.
    #[error("config file: {0}")]
    ConfigFile(String),
}

pub type Result<T> = std::result::Result<T, AstormerError>;

/// Build a [`AstormerError::Shape`] from two dims arrays.
pub(crate) fn shape_error<const D: usize, const E: usize>(
    op: &'static str,
    expected: [usize; D],
    actual: [usize; E],
) -> AstormerError {
    AstormerError::Shape {
        op,
        expected: format!("{expected:?}"),
        actual: format!("{actual:?}"),
    }
}

/// Fail unless `actual == expected`.
pub(crate) fn ensure_dims<const D: usize>(
    op: &'static str,
    expected: [usize; D],
    actual: [usize; D],
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(shape_error(op, expected, actual))
    }
}

/// Validate a dropout-style probability: `0 <= p < 1`.
pub(crate) fn check_probability(name: &str, p: f64) -> Result<()> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(AstormerError::Config(format!(
            "{name} must be in [0, 1), got {p}"
        )))
    }
}
