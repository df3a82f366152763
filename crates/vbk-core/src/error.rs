pub use vbk_types::error::{Result, VbkError};
