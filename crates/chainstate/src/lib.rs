//! Chain-state view stack: coins, sidechains, shielded-pool anchors and
//! nullifiers, layered over a durable store with exact undo on disconnect.

pub mod cache;
pub mod coins;
pub mod commitment;
pub mod error;
pub mod sidechain;
pub mod store;
pub mod undo;
pub mod view;

pub use cache::{CacheView, CoinsModifier};
pub use coins::{CoinEntry, BWT_POS_UNSET};
pub use commitment::CommitmentTree;
pub use error::ChainstateError;
pub use sidechain::{
    BwtState, CertStatusUpdate, Sidechain, SidechainCreationData, SidechainEvents, SidechainState,
};
pub use store::StoreView;
pub use undo::{BlockUndo, OutputUndo, SidechainUndo, TxUndo};
pub use view::{ActiveChain, BackedView, CoinsStats, NullView, ProofVerifier, StateView};
