//! Multi-layer recurrent stacks.
//!
//! The driver is generic over [`RecurrentCell`]: per layer it projects the
//! whole input sequence once, walks the time steps in order, then stacks the
//! step outputs. Locked dropout is applied between layers, never after the
//! last one.

use burn::config::Config;
use burn::module::Module;
use burn::prelude::*;
use rand::Rng;

use crate::error::{self, check_probability, ensure_dims, shape_error, AstormerError};

use super::cell::{CellState, LstmCell, LstmCellConfig, OnLstmCell, OnLstmCellConfig, RecurrentCell};
use super::masks::RecurrentMasks;

/// Hidden and cell state of every layer, each [layers, batch, hidden].
#[derive(Clone, Debug)]
pub struct RecurrentState<B: Backend> {
    pub hidden: Tensor<B, 3>,
    pub cell: Tensor<B, 3>,
}

impl<B: Backend> RecurrentState<B> {
    pub fn zeros(num_layers: usize, batch_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            hidden: Tensor::zeros([num_layers, batch_size, hidden_size], device),
            cell: Tensor::zeros([num_layers, batch_size, hidden_size], device),
        }
    }

    /// State of one layer.
    pub fn layer(&self, index: usize) -> CellState<B> {
        let [_, batch, hidden] = self.hidden.dims();
        let pick = |t: &Tensor<B, 3>| {
            t.clone()
                .slice([index..index + 1, 0..batch, 0..hidden])
                .reshape([batch, hidden])
        };
        CellState {
            hidden: pick(&self.hidden),
            cell: pick(&self.cell),
        }
    }

    fn from_layers(layers: Vec<CellState<B>>) -> Self {
        let (hidden, cell): (Vec<_>, Vec<_>) = layers
            .into_iter()
            .map(|state| (state.hidden, state.cell))
            .unzip();
        Self {
            hidden: Tensor::stack(hidden, 0),
            cell: Tensor::stack(cell, 0),
        }
    }
}

/// Output of a stack.
#[derive(Clone, Debug)]
pub struct RecurrentOutput<B: Backend> {
    /// Top layer outputs, [batch, T, hidden].
    pub outputs: Tensor<B, 3>,
    /// Final state of every layer.
    pub state: RecurrentState<B>,
    /// Every layer's outputs (before locked dropout), when requested.
    pub layers: Option<Vec<Tensor<B, 3>>>,
}

/// Run `cells` over `inputs` ([batch, T, input]).
pub(crate) fn run_stack<B: Backend, C: RecurrentCell<B>>(
    cells: &[C],
    inputs: Tensor<B, 3>,
    initial: Option<RecurrentState<B>>,
    masks: Option<&RecurrentMasks<B>>,
    layerwise: bool,
) -> error::Result<RecurrentOutput<B>> {
    let [batch, seq_len, d_input] = inputs.dims();
    let Some(first) = cells.first() else {
        return Err(AstormerError::Config("recurrent stack has no layers".into()));
    };
    let hidden = first.hidden_size();
    ensure_dims("recurrent input", [batch, seq_len, first.input_size()], [batch, seq_len, d_input])?;
    if seq_len == 0 {
        return Err(AstormerError::Shape {
            op: "recurrent input",
            expected: "at least one time step".into(),
            actual: format!("{:?}", [batch, seq_len, d_input]),
        });
    }

    let num_layers = cells.len();
    let device = inputs.device();
    let state = match initial {
        Some(state) => {
            ensure_dims("initial hidden", [num_layers, batch, hidden], state.hidden.dims())?;
            ensure_dims("initial cell", [num_layers, batch, hidden], state.cell.dims())?;
            state
        }
        None => RecurrentState::zeros(num_layers, batch, hidden, &device),
    };
    if let Some(masks) = masks {
        if masks.num_layers() != num_layers {
            return Err(shape_error("recurrent masks", [num_layers], [masks.num_layers()]));
        }
        if let Some(mask_batch) = masks.batch_size() {
            if mask_batch != batch {
                return Err(shape_error("recurrent masks", [batch], [mask_batch]));
            }
        }
        for (index, cell) in cells.iter().enumerate() {
            if let Some(mask) = masks.weight_mask(index) {
                ensure_dims("dropconnect mask", cell.recurrent().weight_dims(), mask.dims())?;
            }
        }
    }

    let mut layer_input = inputs;
    let mut finals = Vec::with_capacity(num_layers);
    let mut every = Vec::new();
    for (index, cell) in cells.iter().enumerate() {
        let projected = cell.project_inputs(layer_input);
        let width = projected.dims()[2];
        let weight_mask = masks.and_then(|m| m.weight_mask(index));

        let mut step_state = state.layer(index);
        let mut steps = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x_t = projected
                .clone()
                .slice([0..batch, t..t + 1, 0..width])
                .reshape([batch, width]);
            step_state = cell.step(x_t, step_state, weight_mask);
            steps.push(step_state.hidden.clone());
        }
        finals.push(step_state);

        let outputs = Tensor::stack::<3>(steps, 1);
        if layerwise {
            every.push(outputs.clone());
        }
        layer_input = match masks {
            Some(masks) if index + 1 < num_layers => masks.apply_between(index, outputs)?,
            _ => outputs,
        };
    }

    Ok(RecurrentOutput {
        outputs: layer_input,
        state: RecurrentState::from_layers(finals),
        layers: layerwise.then_some(every),
    })
}

fn sample_stack_masks<B: Backend, C: RecurrentCell<B>, R: Rng + ?Sized>(
    cells: &[C],
    dropout: f64,
    batch_size: usize,
    rng: &mut R,
    device: &B::Device,
) -> error::Result<RecurrentMasks<B>> {
    let recurrent: Vec<_> = cells
        .iter()
        .map(|cell| (cell.recurrent().weight_dims(), cell.recurrent().dropconnect()))
        .collect();
    let hidden = cells.first().map_or(0, |cell| cell.hidden_size());
    RecurrentMasks::sample(&recurrent, dropout, batch_size, hidden, rng, device)
}

fn check_layers(num_layers: usize) -> error::Result<()> {
    if num_layers == 0 {
        return Err(AstormerError::Config(
            "recurrent stack needs at least one layer".into(),
        ));
    }
    Ok(())
}

// ─── LSTM ─────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct LstmConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    #[config(default = 1)]
    pub num_layers: usize,
    #[config(default = true)]
    pub bias: bool,
    /// Locked dropout between layers.
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub dropconnect: f64,
}

impl LstmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<Lstm<B>> {
        check_layers(self.num_layers)?;
        check_probability("dropout", self.dropout)?;
        let cells = (0..self.num_layers)
            .map(|i| {
                let input = if i == 0 { self.input_size } else { self.hidden_size };
                LstmCellConfig::new(input, self.hidden_size)
                    .with_bias(self.bias)
                    .with_dropconnect(self.dropconnect)
                    .init(device)
            })
            .collect::<error::Result<Vec<_>>>()?;
        log::debug!(
            "built lstm: {} layers, hidden {}, dropconnect {}",
            self.num_layers,
            self.hidden_size,
            self.dropconnect
        );
        Ok(Lstm {
            cells,
            dropout: self.dropout,
        })
    }
}

#[derive(Module, Debug)]
pub struct Lstm<B: Backend> {
    cells: Vec<LstmCell<B>>,
    dropout: f64,
}

impl<B: Backend> Lstm<B> {
    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    /// Masks for one training sequence.
    pub fn sample_masks<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> error::Result<RecurrentMasks<B>> {
        sample_stack_masks(&self.cells, self.dropout, batch_size, rng, device)
    }

    /// - `inputs`: [batch, T, input]
    /// - `initial`: state per layer, zeros when absent
    /// - `masks`: training masks; `None` runs the inference path
    /// - `layerwise`: also return every layer's outputs
    pub fn forward(
        &self,
        inputs: Tensor<B, 3>,
        initial: Option<RecurrentState<B>>,
        masks: Option<&RecurrentMasks<B>>,
        layerwise: bool,
    ) -> error::Result<RecurrentOutput<B>> {
        run_stack(&self.cells, inputs, initial, masks, layerwise)
    }
}

// ─── ON-LSTM ──────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct OnLstmConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    #[config(default = 1)]
    pub num_layers: usize,
    #[config(default = 8)]
    pub chunk_num: usize,
    #[config(default = true)]
    pub bias: bool,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub dropconnect: f64,
}

impl OnLstmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<OnLstm<B>> {
        check_layers(self.num_layers)?;
        check_probability("dropout", self.dropout)?;
        let cells = (0..self.num_layers)
            .map(|i| {
                let input = if i == 0 { self.input_size } else { self.hidden_size };
                OnLstmCellConfig::new(input, self.hidden_size)
                    .with_chunk_num(self.chunk_num)
                    .with_bias(self.bias)
                    .with_dropconnect(self.dropconnect)
                    .init(device)
            })
            .collect::<error::Result<Vec<_>>>()?;
        log::debug!(
            "built on-lstm: {} layers, hidden {}, {} chunks",
            self.num_layers,
            self.hidden_size,
            self.chunk_num
        );
        Ok(OnLstm {
            cells,
            dropout: self.dropout,
        })
    }
}

#[derive(Module, Debug)]
pub struct OnLstm<B: Backend> {
    cells: Vec<OnLstmCell<B>>,
    dropout: f64,
}

impl<B: Backend> OnLstm<B> {
    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    pub fn sample_masks<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> error::Result<RecurrentMasks<B>> {
        sample_stack_masks(&self.cells, self.dropout, batch_size, rng, device)
    }

    /// Same contract as [`Lstm::forward`].
    pub fn forward(
        &self,
        inputs: Tensor<B, 3>,
        initial: Option<RecurrentState<B>>,
        masks: Option<&RecurrentMasks<B>>,
        layerwise: bool,
    ) -> error::Result<RecurrentOutput<B>> {
        run_stack(&self.cells, inputs, initial, masks, layerwise)
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type B = NdArray;

    fn floats<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn inputs(shape: [usize; 3]) -> Tensor<B, 3> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn shapes_and_layerwise_outputs() {
        let device = Default::default();
        let stack = OnLstmConfig::new(5, 8)
            .with_num_layers(3)
            .with_chunk_num(4)
            .init::<B>(&device)
            .unwrap();
        let out = stack.forward(inputs([2, 4, 5]), None, None, true).unwrap();
        assert_eq!(out.outputs.dims(), [2, 4, 8]);
        assert_eq!(out.state.hidden.dims(), [3, 2, 8]);
        assert_eq!(out.state.cell.dims(), [3, 2, 8]);
        let layers = out.layers.unwrap();
        assert_eq!(layers.len(), 3);
        // without masks the top layer output is the last layerwise entry
        assert_eq!(floats(layers[2].clone()), floats(out.outputs.clone()));
    }

    #[test]
    fn final_state_matches_last_output() {
        let device = Default::default();
        let stack = LstmConfig::new(3, 6).with_num_layers(2).init::<B>(&device).unwrap();
        let out = stack.forward(inputs([2, 5, 3]), None, None, false).unwrap();
        assert!(out.layers.is_none());
        let last = out.outputs.slice([0..2, 4..5, 0..6]).reshape([2, 6]);
        let top = out.state.layer(1).hidden;
        assert_eq!(floats(last), floats(top));
    }

    #[test]
    fn initial_state_is_used() {
        let device = Default::default();
        let stack = LstmConfig::new(3, 4).init::<B>(&device).unwrap();
        let x = inputs([1, 2, 3]);
        let zero = stack.forward(x.clone(), None, None, false).unwrap();
        let initial = RecurrentState {
            hidden: Tensor::ones([1, 1, 4], &device),
            cell: Tensor::ones([1, 1, 4], &device),
        };
        let seeded = stack.forward(x, Some(initial), None, false).unwrap();
        assert_ne!(floats(zero.outputs), floats(seeded.outputs));
    }

    #[test]
    fn bad_shapes_are_errors() {
        let device = Default::default();
        let stack = LstmConfig::new(3, 4).with_num_layers(2).init::<B>(&device).unwrap();
        assert!(stack.forward(inputs([1, 2, 5]), None, None, false).is_err());
        assert!(stack.forward(inputs([1, 0, 3]), None, None, false).is_err());

        let wrong = RecurrentState::zeros(1, 1, 4, &device);
        assert!(stack.forward(inputs([1, 2, 3]), Some(wrong), None, false).is_err());

        let masks = stack
            .sample_masks(3, &mut StdRng::seed_from_u64(1), &device)
            .unwrap();
        assert!(stack.forward(inputs([1, 2, 3]), None, Some(&masks), false).is_err());
    }

    #[test]
    fn masks_from_another_stack_are_rejected() {
        let device = Default::default();
        let lstm = LstmConfig::new(4, 8).init::<B>(&device).unwrap();
        let on_lstm = OnLstmConfig::new(4, 8).with_chunk_num(2).init::<B>(&device).unwrap();
        let masks = lstm
            .sample_masks(2, &mut StdRng::seed_from_u64(5), &device)
            .unwrap();

        let err = on_lstm
            .forward(inputs([2, 3, 4]), None, Some(&masks), false)
            .unwrap_err();
        assert!(matches!(err, AstormerError::Shape { op: "dropconnect mask", .. }));
    }

    #[test]
    fn masks_fixed_within_a_sequence() {
        let device = Default::default();
        let stack = OnLstmConfig::new(4, 8)
            .with_num_layers(2)
            .with_chunk_num(2)
            .with_dropout(0.5)
            .with_dropconnect(0.5)
            .init::<B>(&device)
            .unwrap();
        let masks = stack
            .sample_masks(2, &mut StdRng::seed_from_u64(11), &device)
            .unwrap();
        let x = inputs([2, 3, 4]);
        let a = stack.forward(x.clone(), None, Some(&masks), false).unwrap();
        let b = stack.forward(x, None, Some(&masks), false).unwrap();
        assert_eq!(floats(a.outputs), floats(b.outputs));
    }

    #[test]
    fn zero_layers_is_a_config_error() {
        let device = Default::default();
        let result = LstmConfig::new(3, 4).with_num_layers(0).init::<B>(&device);
        assert!(matches!(result, Err(AstormerError::Config(_))));
    }
}
