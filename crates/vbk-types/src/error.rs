use thiserror::Error;

pub type Result<T> = std::result::Result<T, VbkError>;

#[derive(Debug, Error)]
pub enum VbkError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("block {index} failed: {reason}")]
    BlockFailed { index: usize, reason: String },

    #[error("consolidation inconsistency: {0}")]
    ConsolidationInconsistency(String),

    #[error("operation aborted")]
    AbortRequested,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("target storage error: {0}")]
    Storage(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("missing generation {generation_id} for disk {disk_id}")]
    MissingGeneration { disk_id: u32, generation_id: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl VbkError {
    /// Whether a pipeline worker may retry the block after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VbkError::TransientIo(_) | VbkError::Storage(_) | VbkError::Io(_)
        )
    }

    /// Cooperative cancellation, distinct from a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, VbkError::AbortRequested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(VbkError::TransientIo("read".into()).is_retryable());
        assert!(VbkError::Storage("put".into()).is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(VbkError::from(io).is_retryable());
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        assert!(!VbkError::DecryptionFailed.is_retryable());
        assert!(!VbkError::Decompression("bad".into()).is_retryable());
        assert!(!VbkError::Config("x".into()).is_retryable());
        assert!(!VbkError::ConsolidationInconsistency("x".into()).is_retryable());
        assert!(!VbkError::AbortRequested.is_retryable());
    }

    #[test]
    fn abort_is_not_a_failure_variant() {
        assert!(VbkError::AbortRequested.is_abort());
        assert!(!VbkError::TransientIo("x".into()).is_abort());
    }
}
