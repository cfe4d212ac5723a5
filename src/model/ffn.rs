//! Position-wise feed-forward block: `LayerNorm(x + W2 · relu(W1 · x))`.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

#[derive(Config, Debug)]
pub struct FeedForwardConfig {
    pub d_model: usize,
    /// Inner width as a multiple of `d_model`.
    #[config(default = 4)]
    pub expansion: usize,
}

impl FeedForwardConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        let d_inner = self.d_model * self.expansion;
        FeedForward {
            inner: LinearConfig::new(self.d_model, d_inner).init(device),
            outer: LinearConfig::new(d_inner, self.d_model).init(device),
            norm: LayerNormConfig::new(self.d_model).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    inner: Linear<B>,
    outer: Linear<B>,
    norm: LayerNorm<B>,
}

impl<B: Backend> FeedForward<B> {
    /// Works on any rank whose last axis is `d_model`.
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let hidden = self.outer.forward(relu(self.inner.forward(x.clone())));
        self.norm.forward(x + hidden)
    }
}
