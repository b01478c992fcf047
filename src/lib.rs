pub mod config;
pub mod display;
pub mod errors;
pub mod harness;
pub mod parse;
pub mod sampler;
pub mod sweep;
pub mod types;
