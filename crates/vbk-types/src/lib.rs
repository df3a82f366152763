pub mod block;
pub mod content_key;
pub mod error;
pub mod generation;
