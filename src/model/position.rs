//! Sinusoidal positional encoding followed by LayerNorm and dropout.
//!
//! The table is computed for the requested window on every call, so
//! incremental decoding can ask for a single step at `timestep`.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig};
use burn::prelude::*;

use crate::error::{self, check_probability, shape_error, AstormerError};

#[derive(Config, Debug)]
pub struct PositionalEncodingConfig {
    pub d_model: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Largest position (exclusive) the encoding accepts.
    #[config(default = 5000)]
    pub max_len: usize,
}

impl PositionalEncodingConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<PositionalEncoding<B>> {
        check_probability("dropout", self.dropout)?;
        Ok(PositionalEncoding {
            norm: LayerNormConfig::new(self.d_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            d_model: self.d_model,
            max_len: self.max_len,
        })
    }
}

#[derive(Module, Debug)]
pub struct PositionalEncoding<B: Backend> {
    norm: LayerNorm<B>,
    dropout: Dropout,
    d_model: usize,
    max_len: usize,
}

impl<B: Backend> PositionalEncoding<B> {
    /// Add positions `timestep..timestep + len` to `x` ([batch, len, d_model]).
    pub fn forward(&self, x: Tensor<B, 3>, timestep: usize) -> error::Result<Tensor<B, 3>> {
        let [batch, len, d_model] = x.dims();
        if d_model != self.d_model {
            return Err(shape_error(
                "positional encoding",
                [batch, len, self.d_model],
                [batch, len, d_model],
            ));
        }
        if timestep + len > self.max_len {
            return Err(AstormerError::Shape {
                op: "positional encoding",
                expected: format!("positions below {}", self.max_len),
                actual: format!("positions {timestep}..{}", timestep + len),
            });
        }
        let table = sinusoid_table::<B>(timestep, len, d_model, &x.device())
            .unsqueeze_dim::<3>(0)
            .expand([batch, len, d_model]);
        Ok(self.dropout.forward(self.norm.forward(x + table)))
    }
}

/// Sinusoid rows for positions `start..start + len`.
///
/// Even columns hold `sin(pos / 10000^(2i/d))`, odd columns the matching cosine.
pub fn sinusoid_table<B: Backend>(
    start: usize,
    len: usize,
    d_model: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let log_base = 10000f64.ln() / d_model as f64;
    let mut data = Vec::with_capacity(len * d_model);
    for pos in start..start + len {
        for col in 0..d_model {
            let pair = (col - col % 2) as f64;
            let angle = pos as f64 * (-pair * log_base).exp();
            let value = if col % 2 == 0 { angle.sin() } else { angle.cos() };
            data.push(value as f32);
        }
    }
    Tensor::from_data(TensorData::new(data, [len, d_model]), device)
}
