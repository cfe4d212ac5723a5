pub mod attention;
pub mod composite;
pub mod decoder;
pub mod decoupled;
pub mod encoder;
pub mod ffn;
pub mod masks;
pub mod position;
pub mod relation;
