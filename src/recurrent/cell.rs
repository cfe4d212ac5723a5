//! Recurrent cells: a plain LSTM and the ordered-neuron LSTM.
//!
//! Both cells split their work the same way. The input affine map is
//! applied to the whole sequence at once by the stack driver
//! ([`RecurrentCell::project_inputs`]), and each time step only adds the
//! recurrent affine map of the previous hidden state (with DropConnect).
//!
//! ON-LSTM gate layout of the affine output, per batch row:
//!
//! ```text
//! [ master_in | master_forget | in | forget | out | cell ]
//!   chunk_size  chunk_size     hidden each
//! ```
//!
//! The four standard gates are viewed as `[batch, chunk_size, chunk_num]`;
//! the master gates have one value per chunk row and broadcast along
//! `chunk_num`.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax, tanh};

use crate::error::{self, AstormerError};

use super::dropconnect::{DropConnectLinear, DropConnectLinearConfig};

/// Hidden and cell state of one layer.
#[derive(Clone, Debug)]
pub struct CellState<B: Backend> {
    /// [batch, hidden]
    pub hidden: Tensor<B, 2>,
    /// [batch, hidden]
    pub cell: Tensor<B, 2>,
}

impl<B: Backend> CellState<B> {
    pub fn zeros(batch_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            hidden: Tensor::zeros([batch_size, hidden_size], device),
            cell: Tensor::zeros([batch_size, hidden_size], device),
        }
    }

    pub fn detach(self) -> Self {
        Self {
            hidden: self.hidden.detach(),
            cell: self.cell.detach(),
        }
    }
}

/// A cell the stack driver can run.
pub trait RecurrentCell<B: Backend> {
    fn input_size(&self) -> usize;

    fn hidden_size(&self) -> usize;

    /// The recurrent affine map, target of DropConnect.
    fn recurrent(&self) -> &DropConnectLinear<B>;

    /// Input affine map over a whole sequence: [batch, T, input] → [batch, T, gates].
    fn project_inputs(&self, inputs: Tensor<B, 3>) -> Tensor<B, 3>;

    /// One time step from an already projected input ([batch, gates]).
    fn step(
        &self,
        projected: Tensor<B, 2>,
        state: CellState<B>,
        weight_mask: Option<&Tensor<B, 2>>,
    ) -> CellState<B>;

    /// One time step from a raw input ([batch, input]).
    fn forward(
        &self,
        input: Tensor<B, 2>,
        state: CellState<B>,
        weight_mask: Option<&Tensor<B, 2>>,
    ) -> CellState<B> {
        let [batch, _] = input.dims();
        let projected = self.project_inputs(input.unsqueeze_dim::<3>(1));
        let width = projected.dims()[2];
        self.step(projected.reshape([batch, width]), state, weight_mask)
    }
}

// ─── Cumulative softmax ───────────────────────────────────────────

/// `cumsum(softmax(x))` along the last axis, as a matmul with an
/// upper-triangular matrix of ones.
pub fn cumsoftmax<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let n = x.dims()[1];
    let upper = Tensor::<B, 2>::ones([n, n], &x.device()).triu(0);
    softmax(x, 1).matmul(upper)
}

/// ON-LSTM master gates, each [batch, chunk_size].
#[derive(Clone, Debug)]
pub struct MasterGates<B: Backend> {
    /// Non-increasing in the chunk index.
    pub input: Tensor<B, 2>,
    /// Non-decreasing in the chunk index.
    pub forget: Tensor<B, 2>,
    /// `forget * input`
    pub overlap: Tensor<B, 2>,
}

/// Master gates from their pre-activations.
pub fn master_gates<B: Backend>(pre_input: Tensor<B, 2>, pre_forget: Tensor<B, 2>) -> MasterGates<B> {
    let input = cumsoftmax(pre_input).neg().add_scalar(1.0);
    let forget = cumsoftmax(pre_forget);
    let overlap = forget.clone() * input.clone();
    MasterGates {
        input,
        forget,
        overlap,
    }
}

// ─── LSTM ─────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct LstmCellConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    #[config(default = true)]
    pub bias: bool,
    #[config(default = 0.0)]
    pub dropconnect: f64,
    #[config(default = "Initializer::KaimingUniform{gain:0.5773502691896258, fan_out_only:false}")]
    pub initializer: Initializer,
}

impl LstmCellConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<LstmCell<B>> {
        let gates = 4 * self.hidden_size;
        Ok(LstmCell {
            input: LinearConfig::new(self.input_size, gates)
                .with_bias(self.bias)
                .with_initializer(self.initializer.clone())
                .init(device),
            recurrent: DropConnectLinearConfig::new(self.hidden_size, gates)
                .with_bias(self.bias)
                .with_dropconnect(self.dropconnect)
                .with_initializer(self.initializer.clone())
                .init(device)?,
            input_size: self.input_size,
            hidden_size: self.hidden_size,
        })
    }
}

/// LSTM cell, gate order `in, forget, out, cell`.
#[derive(Module, Debug)]
pub struct LstmCell<B: Backend> {
    input: Linear<B>,
    recurrent: DropConnectLinear<B>,
    input_size: usize,
    hidden_size: usize,
}

impl<B: Backend> RecurrentCell<B> for LstmCell<B> {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn recurrent(&self) -> &DropConnectLinear<B> {
        &self.recurrent
    }

    fn project_inputs(&self, inputs: Tensor<B, 3>) -> Tensor<B, 3> {
        self.input.forward(inputs)
    }

    fn step(
        &self,
        projected: Tensor<B, 2>,
        state: CellState<B>,
        weight_mask: Option<&Tensor<B, 2>>,
    ) -> CellState<B> {
        let gates = projected + self.recurrent.forward(state.hidden, weight_mask);
        let [batch, _] = gates.dims();
        let h = self.hidden_size;
        let gate = |i: usize| gates.clone().slice([0..batch, i * h..(i + 1) * h]);

        let input = sigmoid(gate(0));
        let forget = sigmoid(gate(1));
        let output = sigmoid(gate(2));
        let candidate = tanh(gate(3));

        let cell = forget * state.cell + input * candidate;
        let hidden = output * tanh(cell.clone());
        CellState { hidden, cell }
    }
}

// ─── ON-LSTM ──────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct OnLstmCellConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    /// Number of chunks; `hidden_size` must be a multiple.
    #[config(default = 8)]
    pub chunk_num: usize,
    #[config(default = true)]
    pub bias: bool,
    #[config(default = 0.0)]
    pub dropconnect: f64,
    #[config(default = "Initializer::KaimingUniform{gain:0.5773502691896258, fan_out_only:false}")]
    pub initializer: Initializer,
}

impl OnLstmCellConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<OnLstmCell<B>> {
        if self.chunk_num == 0 || self.hidden_size % self.chunk_num != 0 {
            return Err(AstormerError::Config(format!(
                "hidden_size ({}) must be a positive multiple of chunk_num ({})",
                self.hidden_size, self.chunk_num
            )));
        }
        let chunk_size = self.hidden_size / self.chunk_num;
        let gates = 4 * self.hidden_size + 2 * chunk_size;
        Ok(OnLstmCell {
            input: LinearConfig::new(self.input_size, gates)
                .with_bias(self.bias)
                .with_initializer(self.initializer.clone())
                .init(device),
            recurrent: DropConnectLinearConfig::new(self.hidden_size, gates)
                .with_bias(self.bias)
                .with_dropconnect(self.dropconnect)
                .with_initializer(self.initializer.clone())
                .init(device)?,
            input_size: self.input_size,
            hidden_size: self.hidden_size,
            chunk_num: self.chunk_num,
            chunk_size,
        })
    }
}

/// Ordered-neuron LSTM cell.
#[derive(Module, Debug)]
pub struct OnLstmCell<B: Backend> {
    input: Linear<B>,
    recurrent: DropConnectLinear<B>,
    input_size: usize,
    hidden_size: usize,
    chunk_num: usize,
    chunk_size: usize,
}

impl<B: Backend> OnLstmCell<B> {
    pub fn chunk_num(&self) -> usize {
        self.chunk_num
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<B: Backend> RecurrentCell<B> for OnLstmCell<B> {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn recurrent(&self) -> &DropConnectLinear<B> {
        &self.recurrent
    }

    fn project_inputs(&self, inputs: Tensor<B, 3>) -> Tensor<B, 3> {
        self.input.forward(inputs)
    }

    fn step(
        &self,
        projected: Tensor<B, 2>,
        state: CellState<B>,
        weight_mask: Option<&Tensor<B, 2>>,
    ) -> CellState<B> {
        let gates = projected + self.recurrent.forward(state.hidden, weight_mask);
        let [batch, _] = gates.dims();
        let (cs, n, h) = (self.chunk_size, self.chunk_num, self.hidden_size);

        let master = master_gates(
            gates.clone().slice([0..batch, 0..cs]),
            gates.clone().slice([0..batch, cs..2 * cs]),
        );
        let offset = 2 * cs;
        let gate = |i: usize| {
            gates
                .clone()
                .slice([0..batch, offset + i * h..offset + (i + 1) * h])
                .reshape([batch, cs, n])
        };
        let broadcast = |t: Tensor<B, 2>| t.unsqueeze_dim::<3>(2).expand([batch, cs, n]);

        let input = sigmoid(gate(0));
        let forget = sigmoid(gate(1));
        let output = sigmoid(gate(2));
        let candidate = tanh(gate(3));

        let overlap = broadcast(master.overlap);
        let master_forget = broadcast(master.forget);
        let master_input = broadcast(master.input);
        let forget = forget * overlap.clone() + (master_forget - overlap.clone());
        let input = input * overlap.clone() + (master_input - overlap);

        let previous = state.cell.reshape([batch, cs, n]);
        let cell = forget * previous + input * candidate;
        let hidden = output * tanh(cell.clone());

        CellState {
            hidden: hidden.reshape([batch, h]),
            cell: cell.reshape([batch, h]),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
