use std::fmt;

use zephyrd_primitives::encoding::DecodeError;
use zephyrd_storage::StoreError;

/// Failures surfaced to block processing, which converts them into consensus
/// rejections. Programmer errors (modifier uniqueness, undo preconditions)
/// are asserted instead.
#[derive(Debug)]
pub enum ChainstateError {
    NotFound(&'static str),
    Inconsistent(&'static str),
    InsufficientBalance,
    ProofInvalid,
    QualityRejected,
    Store(StoreError),
    Decode(DecodeError),
}

impl fmt::Display for ChainstateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainstateError::NotFound(what) => write!(f, "not found: {what}"),
            ChainstateError::Inconsistent(what) => write!(f, "inconsistent state: {what}"),
            ChainstateError::InsufficientBalance => write!(f, "insufficient sidechain balance"),
            ChainstateError::ProofInvalid => write!(f, "proof verification failed"),
            ChainstateError::QualityRejected => {
                write!(f, "certificate quality not better than current top")
            }
            ChainstateError::Store(err) => write!(f, "{err}"),
            ChainstateError::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChainstateError {}

impl From<StoreError> for ChainstateError {
    fn from(err: StoreError) -> Self {
        ChainstateError::Store(err)
    }
}

impl From<DecodeError> for ChainstateError {
    fn from(err: DecodeError) -> Self {
        ChainstateError::Decode(err)
    }
}
