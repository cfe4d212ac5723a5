//! Recurrent layers: LSTM and ordered-neuron LSTM stacks with DropConnect
//! on the recurrent weights and locked dropout between layers.

pub mod cell;
pub mod dropconnect;
pub mod masks;
pub mod stack;

pub use cell::{CellState, LstmCell, OnLstmCell, RecurrentCell};
pub use masks::RecurrentMasks;
pub use stack::{Lstm, LstmConfig, OnLstm, OnLstmConfig, RecurrentOutput, RecurrentState};
