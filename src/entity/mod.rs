pub mod normalizer;
pub mod types;

pub use types::*;
