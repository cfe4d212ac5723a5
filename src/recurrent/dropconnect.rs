//! Affine map with DropConnect on its weight matrix.
//!
//! During training a 0/1 keep mask over the weights is sampled once per
//! sequence and passed to every step. At inference the weights are scaled by
//! `1 - p`, the expectation of the masked weights.

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::Initializer;
use burn::prelude::*;
use rand::Rng;

use crate::error::{self, check_probability};

#[derive(Config, Debug)]
pub struct DropConnectLinearConfig {
    pub d_input: usize,
    pub d_output: usize,
    #[config(default = true)]
    pub bias: bool,
    /// Probability of dropping each weight.
    #[config(default = 0.0)]
    pub dropconnect: f64,
    #[config(default = "Initializer::KaimingUniform{gain:0.5773502691896258, fan_out_only:false}")]
    pub initializer: Initializer,
}

impl DropConnectLinearConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<DropConnectLinear<B>> {
        check_probability("dropconnect", self.dropconnect)?;
        let fan_in = Some(self.d_input);
        let fan_out = Some(self.d_output);
        Ok(DropConnectLinear {
            weight: self.initializer.init_with(
                [self.d_input, self.d_output],
                fan_in,
                fan_out,
                device,
            ),
            bias: self
                .bias
                .then(|| self.initializer.init_with([self.d_output], fan_in, fan_out, device)),
            dropconnect: self.dropconnect,
        })
    }
}

#[derive(Module, Debug)]
pub struct DropConnectLinear<B: Backend> {
    /// [d_input, d_output]
    weight: Param<Tensor<B, 2>>,
    /// [d_output]
    bias: Option<Param<Tensor<B, 1>>>,
    dropconnect: f64,
}

impl<B: Backend> DropConnectLinear<B> {
    pub fn dropconnect(&self) -> f64 {
        self.dropconnect
    }

    /// `[d_input, d_output]`, also the shape of a weight mask.
    pub fn weight_dims(&self) -> [usize; 2] {
        self.weight.dims()
    }

    /// `x · W + b`.
    ///
    /// - `input`: [batch, d_input]
    /// - `mask`: 0/1 keep mask shaped like the weights, or `None` for the
    ///   expectation path
    pub fn forward(&self, input: Tensor<B, 2>, mask: Option<&Tensor<B, 2>>) -> Tensor<B, 2> {
        let weight = match mask {
            Some(mask) => self.weight.val() * mask.clone(),
            None => self.weight.val().mul_scalar(1.0 - self.dropconnect),
        };
        let output = input.matmul(weight);
        match &self.bias {
            Some(bias) => output + bias.val().unsqueeze_dim::<2>(0),
            None => output,
        }
    }

    /// Sample a keep mask: each weight survives with probability `1 - p`.
    pub fn sample_mask<R: Rng + ?Sized>(&self, rng: &mut R, device: &B::Device) -> Tensor<B, 2> {
        bernoulli_mask(self.weight_dims(), self.dropconnect, 1.0, rng, device)
    }
}

/// Tensor whose entries are `0` with probability `drop`, else `keep_value`.
pub(crate) fn bernoulli_mask<B: Backend, R: Rng + ?Sized, const D: usize>(
    shape: [usize; D],
    drop: f64,
    keep_value: f32,
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, D> {
    let numel = shape.iter().product::<usize>();
    let data: Vec<f32> = (0..numel)
        .map(|_| if rng.random_bool(drop) { 0.0 } else { keep_value })
        .collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}
