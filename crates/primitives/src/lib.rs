//! Core transaction/certificate types and byte-level serialization.

pub mod compress;
pub mod encoding;
pub mod outpoint;
pub mod transaction;

pub use outpoint::OutPoint;
pub use transaction::{
    BwtRequestOut, Certificate, ForwardTransferOut, JoinSplit, ScCreationOut, Transaction, TxIn,
    TxOut,
};
