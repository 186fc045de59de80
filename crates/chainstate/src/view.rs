//! The read interface over chain state and the contracts injected into it.

use std::collections::BTreeSet;

use zephyrd_consensus::{Hash256, NULL_HASH};
use zephyrd_primitives::Certificate;

use crate::cache::{AnchorsMap, CoinsMap, NullifiersMap, SidechainEventsMap, SidechainsMap};
use crate::coins::CoinEntry;
use crate::commitment::CommitmentTree;
use crate::error::ChainstateError;
use crate::sidechain::{Sidechain, SidechainEvents};

/// Aggregate statistics over the coin set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CoinsStats {
    pub coins: u64,
    pub outputs: u64,
    pub total_amount: i64,
}

/// A view over chain state: coins, sidechains, events, anchors, nullifiers
/// and the best-block / best-anchor markers, plus a single batched write
/// sink.
///
/// Reads take `&mut self` because caching layers hydrate lazily; callers
/// serialize access externally. The defaults answer "empty", so a unit
/// struct works as the bottom view in tests.
pub trait StateView {
    fn get_coins(&mut self, _txid: &Hash256) -> Option<CoinEntry> {
        None
    }

    fn have_coins(&mut self, _txid: &Hash256) -> bool {
        false
    }

    fn get_anchor_at(&mut self, _root: &Hash256) -> Option<CommitmentTree> {
        None
    }

    /// Whether the nullifier has been spent.
    fn get_nullifier(&mut self, _nullifier: &Hash256) -> bool {
        false
    }

    fn get_sidechain(&mut self, _sc_id: &Hash256) -> Option<Sidechain> {
        None
    }

    fn have_sidechain(&mut self, _sc_id: &Hash256) -> bool {
        false
    }

    fn get_sidechain_events(&mut self, _height: u32) -> Option<SidechainEvents> {
        None
    }

    fn have_sidechain_events(&mut self, _height: u32) -> bool {
        false
    }

    /// All known sidechain ids, replacing the contents of `out`.
    fn get_sc_ids(&mut self, out: &mut BTreeSet<Hash256>) {
        out.clear();
    }

    /// Whether no better same-epoch certificate is already known.
    fn check_quality(&mut self, _cert: &Certificate) -> bool {
        false
    }

    fn get_best_block(&mut self) -> Hash256 {
        NULL_HASH
    }

    fn get_best_anchor(&mut self) -> Hash256 {
        NULL_HASH
    }

    fn get_stats(&mut self) -> Option<CoinsStats> {
        None
    }

    /// Atomically absorb a child layer's dirty state. The maps are drained.
    #[allow(clippy::too_many_arguments)]
    fn batch_write(
        &mut self,
        _coins: &mut CoinsMap,
        _best_block: &Hash256,
        _best_anchor: &Hash256,
        _anchors: &mut AnchorsMap,
        _nullifiers: &mut NullifiersMap,
        _sidechains: &mut SidechainsMap,
        _sidechain_events: &mut SidechainEventsMap,
    ) -> Result<(), ChainstateError> {
        Err(ChainstateError::Inconsistent(
            "view does not accept batch writes",
        ))
    }
}

/// Bottom-of-stack view with nothing in it.
#[derive(Debug, Default)]
pub struct NullView;

impl StateView for NullView {}

/// Pass-through view over a rebindable base. Lets the base under a cache be
/// swapped without rebuilding the cache.
pub struct BackedView<'a> {
    base: &'a mut dyn StateView,
}

impl<'a> BackedView<'a> {
    pub fn new(base: &'a mut dyn StateView) -> Self {
        Self { base }
    }

    pub fn set_backend(&mut self, base: &'a mut dyn StateView) {
        self.base = base;
    }
}

impl StateView for BackedView<'_> {
    fn get_coins(&mut self, txid: &Hash256) -> Option<CoinEntry> {
        self.base.get_coins(txid)
    }

    fn have_coins(&mut self, txid: &Hash256) -> bool {
        self.base.have_coins(txid)
    }

    fn get_anchor_at(&mut self, root: &Hash256) -> Option<CommitmentTree> {
        self.base.get_anchor_at(root)
    }

    fn get_nullifier(&mut self, nullifier: &Hash256) -> bool {
        self.base.get_nullifier(nullifier)
    }

    fn get_sidechain(&mut self, sc_id: &Hash256) -> Option<Sidechain> {
        self.base.get_sidechain(sc_id)
    }

    fn have_sidechain(&mut self, sc_id: &Hash256) -> bool {
        self.base.have_sidechain(sc_id)
    }

    fn get_sidechain_events(&mut self, height: u32) -> Option<SidechainEvents> {
        self.base.get_sidechain_events(height)
    }

    fn have_sidechain_events(&mut self, height: u32) -> bool {
        self.base.have_sidechain_events(height)
    }

    fn get_sc_ids(&mut self, out: &mut BTreeSet<Hash256>) {
        self.base.get_sc_ids(out)
    }

    fn check_quality(&mut self, cert: &Certificate) -> bool {
        self.base.check_quality(cert)
    }

    fn get_best_block(&mut self) -> Hash256 {
        self.base.get_best_block()
    }

    fn get_best_anchor(&mut self) -> Hash256 {
        self.base.get_best_anchor()
    }

    fn get_stats(&mut self) -> Option<CoinsStats> {
        self.base.get_stats()
    }

    fn batch_write(
        &mut self,
        coins: &mut CoinsMap,
        best_block: &Hash256,
        best_anchor: &Hash256,
        anchors: &mut AnchorsMap,
        nullifiers: &mut NullifiersMap,
        sidechains: &mut SidechainsMap,
        sidechain_events: &mut SidechainEventsMap,
    ) -> Result<(), ChainstateError> {
        self.base.batch_write(
            coins,
            best_block,
            best_anchor,
            anchors,
            nullifiers,
            sidechains,
            sidechain_events,
        )
    }
}

/// Injected zero-knowledge proof verifier.
pub trait ProofVerifier {
    fn verify_cert(
        &self,
        constant: &[u8],
        w_cert_vk: &[u8],
        prev_end_epoch_block_hash: &Hash256,
        cert: &Certificate,
    ) -> bool;

    #[allow(clippy::too_many_arguments)]
    fn verify_bwt_request(
        &self,
        sc_id: &Hash256,
        sc_request_data: &[u8],
        mc_destination_address: &[u8],
        sc_fee: i64,
        sc_proof: &[u8],
        w_mbtr_vk: &[u8],
        active_cert_data_hash: &Hash256,
    ) -> bool;
}

/// The only coupling to consensus beyond the proof verifier: membership and
/// lookup over the active chain.
pub trait ActiveChain {
    /// Height of the chain tip.
    fn height(&self) -> u32;

    fn contains(&self, block_hash: &Hash256) -> bool;

    fn block_hash_at(&self, height: u32) -> Option<Hash256>;
}
