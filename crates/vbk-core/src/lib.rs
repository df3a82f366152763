pub mod backend;
pub mod chain;
pub mod compress;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod query;

pub use vbk_crypto as crypto;
pub use vbk_types as types;

#[cfg(test)]
mod tests;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
