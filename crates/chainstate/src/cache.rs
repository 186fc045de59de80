//! The layered chain-state cache.
//!
//! A `CacheView` tracks its difference against a base `StateView` in five
//! maps, hydrates entries lazily on first read, and either drains upward into
//! the base (`flush`) or is dropped wholesale to abandon the changes.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};
use zephyrd_consensus::{hash_is_null, ChainParams, Hash256};
use zephyrd_primitives::{
    BwtRequestOut, Certificate, ForwardTransferOut, ScCreationOut, Transaction, TxIn, TxOut,
};

use crate::coins::{CoinEntry, BWT_POS_UNSET};
use crate::commitment::CommitmentTree;
use crate::error::ChainstateError;
use crate::sidechain::{
    BwtState, CertStatusUpdate, Sidechain, SidechainEvents, SidechainState,
};
use crate::undo::{BlockUndo, OutputUndo, SidechainUndo};
use crate::view::{ActiveChain, CoinsStats, ProofVerifier, StateView};

/// This layer has a change the base has not seen.
pub const DIRTY: u8 = 0x1;
/// The base has no (or only a pruned) version of this entry.
pub const FRESH: u8 = 0x2;

#[derive(Clone, Debug, Default)]
pub struct CoinsCacheEntry {
    pub coins: CoinEntry,
    pub flags: u8,
}

#[derive(Clone, Debug, Default)]
pub struct AnchorsCacheEntry {
    pub entered: bool,
    pub tree: CommitmentTree,
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullifiersCacheEntry {
    pub entered: bool,
    pub flags: u8,
}

/// Single-valued diff state for sidechain and event entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flag {
    /// Loaded from the base, unchanged.
    Default,
    /// Unknown to the base; erasing it here leaves no trace.
    Fresh,
    /// Changed here, to be written upward.
    Dirty,
    /// Logically deleted at this layer.
    Erased,
}

#[derive(Clone, Debug)]
pub struct MutableCacheEntry<T> {
    pub payload: T,
    pub flag: Flag,
}

pub type CoinsMap = HashMap<Hash256, CoinsCacheEntry>;
pub type AnchorsMap = HashMap<Hash256, AnchorsCacheEntry>;
pub type NullifiersMap = HashMap<Hash256, NullifiersCacheEntry>;
pub type SidechainsCacheEntry = MutableCacheEntry<Sidechain>;
pub type SidechainEventsCacheEntry = MutableCacheEntry<SidechainEvents>;
pub type SidechainsMap = HashMap<Hash256, SidechainsCacheEntry>;
pub type SidechainEventsMap = HashMap<u32, SidechainEventsCacheEntry>;

fn write_mutable_entry<K, T>(
    key: K,
    child: MutableCacheEntry<T>,
    parent: &mut HashMap<K, MutableCacheEntry<T>>,
) -> Result<(), ChainstateError>
where
    K: Eq + std::hash::Hash,
{
    match parent.entry(key) {
        Entry::Vacant(slot) => {
            if child.flag != Flag::Default {
                slot.insert(child);
            }
        }
        Entry::Occupied(mut slot) => match child.flag {
            Flag::Default => {}
            Flag::Fresh => {
                return Err(ChainstateError::Inconsistent(
                    "fresh child entry collides with an existing parent entry",
                ));
            }
            Flag::Dirty => {
                let keep_fresh = slot.get().flag == Flag::Fresh;
                let entry = slot.get_mut();
                entry.payload = child.payload;
                entry.flag = if keep_fresh { Flag::Fresh } else { Flag::Dirty };
            }
            Flag::Erased => {
                if slot.get().flag == Flag::Fresh {
                    slot.remove();
                } else {
                    slot.get_mut().flag = Flag::Erased;
                }
            }
        },
    }
    Ok(())
}

/// A `StateView` layered over a mutable base, tracking its own changes.
pub struct CacheView<'a> {
    base: &'a mut dyn StateView,
    cache_coins: CoinsMap,
    cache_anchors: AnchorsMap,
    cache_nullifiers: NullifiersMap,
    cache_sidechains: SidechainsMap,
    cache_sidechain_events: SidechainEventsMap,
    best_block_hash: Hash256,
    best_anchor_root: Hash256,
    has_modifier: bool,
    cached_usage: usize,
    sc_coins_maturity: u32,
}

impl<'a> CacheView<'a> {
    pub fn new(base: &'a mut dyn StateView, params: &ChainParams) -> Self {
        Self {
            base,
            cache_coins: CoinsMap::default(),
            cache_anchors: AnchorsMap::default(),
            cache_nullifiers: NullifiersMap::default(),
            cache_sidechains: SidechainsMap::default(),
            cache_sidechain_events: SidechainEventsMap::default(),
            best_block_hash: [0u8; 32],
            best_anchor_root: [0u8; 32],
            has_modifier: false,
            cached_usage: 0,
            sc_coins_maturity: params.sc_coins_maturity,
        }
    }

    pub fn set_backend(&mut self, base: &'a mut dyn StateView) {
        self.base = base;
    }

    /// Entries in the coins map.
    pub fn cache_size(&self) -> usize {
        self.cache_coins.len()
    }

    /// Lazily maintained estimate of heap bytes held by cached payloads.
    pub fn dynamic_memory_usage(&self) -> usize {
        fn map_usage<K, V>(map: &HashMap<K, V>) -> usize {
            map.capacity() * (std::mem::size_of::<K>() + std::mem::size_of::<V>())
        }
        map_usage(&self.cache_coins)
            + map_usage(&self.cache_anchors)
            + map_usage(&self.cache_nullifiers)
            + map_usage(&self.cache_sidechains)
            + map_usage(&self.cache_sidechain_events)
            + self.cached_usage
    }

    fn fetch_coins(&mut self, txid: &Hash256) -> Option<&CoinsCacheEntry> {
        if !self.cache_coins.contains_key(txid) {
            let coins = self.base.get_coins(txid)?;
            let mut entry = CoinsCacheEntry { coins, flags: 0 };
            if entry.coins.is_pruned() {
                // The base only has an empty shell; this layer may drop the
                // entry entirely instead of writing a prune upward.
                entry.flags = FRESH;
            }
            self.cached_usage += entry.coins.dynamic_memory_usage();
            self.cache_coins.insert(*txid, entry);
        }
        self.cache_coins.get(txid)
    }

    pub fn access_coins(&mut self, txid: &Hash256) -> Option<&CoinEntry> {
        self.fetch_coins(txid).map(|entry| &entry.coins)
    }

    /// Scoped unique mutation of one coin entry. At most one modifier may be
    /// outstanding per view.
    pub fn modify_coins(&mut self, txid: &Hash256) -> CoinsModifier<'_, 'a> {
        assert!(!self.has_modifier, "coins modifier already outstanding");
        let old_usage = match self.cache_coins.entry(*txid) {
            Entry::Occupied(entry) => entry.get().coins.dynamic_memory_usage(),
            Entry::Vacant(slot) => {
                let entry = match self.base.get_coins(txid) {
                    Some(coins) => {
                        let flags = if coins.is_pruned() { FRESH } else { 0 };
                        CoinsCacheEntry { coins, flags }
                    }
                    None => CoinsCacheEntry {
                        coins: CoinEntry::default(),
                        flags: FRESH,
                    },
                };
                slot.insert(entry);
                0
            }
        };
        let entry = self
            .cache_coins
            .get_mut(txid)
            .expect("modifier target just ensured");
        // The caller is assumed to modify the entry.
        entry.flags |= DIRTY;
        self.has_modifier = true;
        CoinsModifier {
            cache: self,
            txid: *txid,
            old_usage,
        }
    }

    /// Spend one output position; false if the coin or position is missing.
    pub fn spend_coin(&mut self, txid: &Hash256, pos: u32) -> bool {
        if self.access_coins(txid).is_none() {
            return false;
        }
        let mut coins = self.modify_coins(txid);
        coins.spend(pos)
    }

    pub fn set_best_block(&mut self, block_hash: Hash256) {
        self.best_block_hash = block_hash;
    }

    pub fn push_anchor(&mut self, tree: CommitmentTree) {
        let new_root = tree.root();
        let current_root = self.get_best_anchor();
        // A block without joinsplits re-pushes the tree it inherited;
        // overwriting the existing anchor entry would corrupt `entered`.
        if current_root == new_root {
            return;
        }
        match self.cache_anchors.entry(new_root) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.entered = true;
                entry.tree = tree;
                entry.flags = DIRTY;
            }
            Entry::Vacant(slot) => {
                self.cached_usage += tree.dynamic_memory_usage();
                slot.insert(AnchorsCacheEntry {
                    entered: true,
                    tree,
                    flags: DIRTY,
                });
            }
        }
        self.best_anchor_root = new_root;
    }

    pub fn pop_anchor(&mut self, new_root: &Hash256) {
        let current_root = self.get_best_anchor();
        // Restoring the root the chain already sits on is a no-op.
        if current_root == *new_root {
            return;
        }
        let hydrated = self.get_anchor_at(&current_root);
        assert!(hydrated.is_some(), "current anchor must be materialized");
        let entry = self
            .cache_anchors
            .get_mut(&current_root)
            .expect("hydrated above");
        entry.entered = false;
        entry.flags = DIRTY;
        self.best_anchor_root = *new_root;
    }

    pub fn set_nullifier(&mut self, nullifier: &Hash256, spent: bool) {
        let entry = self.cache_nullifiers.entry(*nullifier).or_default();
        entry.entered = spent;
        entry.flags |= DIRTY;
    }

    fn fetch_sidechains(&mut self, sc_id: &Hash256) -> Option<&SidechainsCacheEntry> {
        if !self.cache_sidechains.contains_key(sc_id) {
            let sidechain = self.base.get_sidechain(sc_id)?;
            self.cached_usage += sidechain.dynamic_memory_usage();
            self.cache_sidechains.insert(
                *sc_id,
                MutableCacheEntry {
                    payload: sidechain,
                    flag: Flag::Default,
                },
            );
        }
        self.cache_sidechains.get(sc_id)
    }

    pub fn access_sidechain(&mut self, sc_id: &Hash256) -> Option<&Sidechain> {
        self.fetch_sidechains(sc_id)
            .filter(|entry| entry.flag != Flag::Erased)
            .map(|entry| &entry.payload)
    }

    fn modify_sidechain(&mut self, sc_id: &Hash256) -> &mut SidechainsCacheEntry {
        match self.cache_sidechains.entry(*sc_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let (payload, flag) = match self.base.get_sidechain(sc_id) {
                    Some(sidechain) => (sidechain, Flag::Default),
                    None => (Sidechain::default(), Flag::Fresh),
                };
                self.cached_usage += payload.dynamic_memory_usage();
                slot.insert(MutableCacheEntry { payload, flag })
            }
        }
    }

    fn fetch_sidechain_events(&mut self, height: u32) -> Option<&SidechainEventsCacheEntry> {
        if !self.cache_sidechain_events.contains_key(&height) {
            let events = self.base.get_sidechain_events(height)?;
            self.cached_usage += events.dynamic_memory_usage();
            self.cache_sidechain_events.insert(
                height,
                MutableCacheEntry {
                    payload: events,
                    flag: Flag::Default,
                },
            );
        }
        self.cache_sidechain_events.get(&height)
    }

    fn modify_sidechain_events(&mut self, height: u32) -> &mut SidechainEventsCacheEntry {
        match self.cache_sidechain_events.entry(height) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let (payload, flag) = match self.base.get_sidechain_events(height) {
                    Some(events) => (events, Flag::Default),
                    None => (SidechainEvents::default(), Flag::Fresh),
                };
                self.cached_usage += payload.dynamic_memory_usage();
                slot.insert(MutableCacheEntry { payload, flag })
            }
        }
    }

    /// Drain this layer's state into the base and reset.
    pub fn flush(&mut self) -> Result<(), ChainstateError> {
        self.base.batch_write(
            &mut self.cache_coins,
            &self.best_block_hash,
            &self.best_anchor_root,
            &mut self.cache_anchors,
            &mut self.cache_nullifiers,
            &mut self.cache_sidechains,
            &mut self.cache_sidechain_events,
        )?;
        self.cache_coins.clear();
        self.cache_anchors.clear();
        self.cache_nullifiers.clear();
        self.cache_sidechains.clear();
        self.cache_sidechain_events.clear();
        self.cached_usage = 0;
        Ok(())
    }

    /// Apply the per-block sidechain effects of the block's one top-quality
    /// transaction set: creations, forward transfers and backward-transfer
    /// requests all schedule immature amounts.
    pub fn update_sidechain_on_tx(
        &mut self,
        tx: &Transaction,
        block_hash: &Hash256,
        height: u32,
    ) -> Result<(), ChainstateError> {
        let maturity_height = height + self.sc_coins_maturity;

        for creation in &tx.sc_creations {
            if self.have_sidechain(&creation.sc_id) {
                warn!(target: "sc", sc_id = ?creation.sc_id, "sidechain already exists");
                return Err(ChainstateError::Inconsistent("sidechain already created"));
            }
            let entry = self.modify_sidechain(&creation.sc_id);
            let sidechain = &mut entry.payload;
            sidechain.creation_block_hash = *block_hash;
            sidechain.creation_block_height = height;
            sidechain.creation_tx_hash = tx.hash;
            sidechain.last_top_quality_cert_hash = [0u8; 32];
            sidechain.last_top_quality_cert_referenced_epoch = Certificate::EPOCH_NULL;
            sidechain.last_top_quality_cert_quality = Certificate::QUALITY_NULL;
            sidechain.last_top_quality_cert_bwt_amount = 0;
            sidechain.creation_data.withdrawal_epoch_length = creation.withdrawal_epoch_length;
            sidechain.creation_data.custom_data = creation.custom_data.clone();
            sidechain.creation_data.constant = creation.constant.clone();
            sidechain.creation_data.w_cert_vk = creation.w_cert_vk.clone();
            sidechain.creation_data.w_mbtr_vk = creation.w_mbtr_vk.clone();
            sidechain.immature_amounts.insert(maturity_height, creation.value);
            sidechain.current_state = SidechainState::Alive;
            entry.flag = Flag::Fresh;
            debug!(target: "sc", sc_id = ?creation.sc_id, maturity_height, "sidechain created");
        }

        for forward in &tx.forward_transfers {
            if !self.have_sidechain(&forward.sc_id) {
                warn!(target: "sc", sc_id = ?forward.sc_id, "forward transfer to unknown sidechain");
                return Err(ChainstateError::NotFound("sidechain for forward transfer"));
            }
            let entry = self.modify_sidechain(&forward.sc_id);
            *entry
                .payload
                .immature_amounts
                .entry(maturity_height)
                .or_insert(0) += forward.value;
            if entry.flag != Flag::Fresh {
                entry.flag = Flag::Dirty;
            }
        }

        for request in &tx.bwt_requests {
            if !self.have_sidechain(&request.sc_id) {
                warn!(target: "sc", sc_id = ?request.sc_id, "bwt request for unknown sidechain");
                return Err(ChainstateError::NotFound("sidechain for bwt request"));
            }
            let entry = self.modify_sidechain(&request.sc_id);
            *entry
                .payload
                .immature_amounts
                .entry(maturity_height)
                .or_insert(0) += request.sc_fee;
            if entry.flag != Flag::Fresh {
                entry.flag = Flag::Dirty;
            }
        }

        Ok(())
    }

    /// Inverse of [`Self::update_sidechain_on_tx`], applied on disconnect.
    pub fn revert_tx_outputs(&mut self, tx: &Transaction, height: u32) -> Result<(), ChainstateError> {
        let maturity_height = height + self.sc_coins_maturity;

        for request in &tx.bwt_requests {
            if !self.have_sidechain(&request.sc_id) {
                return Err(ChainstateError::NotFound("sidechain for bwt request undo"));
            }
            self.decrement_immature_amount(&request.sc_id, request.sc_fee, maturity_height)?;
        }

        for forward in &tx.forward_transfers {
            if !self.have_sidechain(&forward.sc_id) {
                return Err(ChainstateError::NotFound("sidechain for forward undo"));
            }
            self.decrement_immature_amount(&forward.sc_id, forward.value, maturity_height)?;
        }

        for creation in &tx.sc_creations {
            if !self.have_sidechain(&creation.sc_id) {
                return Err(ChainstateError::NotFound("sidechain for creation undo"));
            }
            self.decrement_immature_amount(&creation.sc_id, creation.value, maturity_height)?;
            let entry = self.modify_sidechain(&creation.sc_id);
            if entry.payload.balance > 0 {
                warn!(target: "sc", sc_id = ?creation.sc_id, balance = entry.payload.balance,
                    "reverting creation of sidechain with residual balance");
                return Err(ChainstateError::Inconsistent(
                    "sidechain balance not drained at creation undo",
                ));
            }
            entry.flag = Flag::Erased;
            debug!(target: "sc", sc_id = ?creation.sc_id, "sidechain removed");
        }

        Ok(())
    }

    fn decrement_immature_amount(
        &mut self,
        sc_id: &Hash256,
        value: i64,
        maturity_height: u32,
    ) -> Result<(), ChainstateError> {
        let entry = self.modify_sidechain(sc_id);
        let Some(amount) = entry.payload.immature_amounts.get_mut(&maturity_height) else {
            warn!(target: "sc", sc_id = ?sc_id, maturity_height, "no immature amount to decrement");
            return Err(ChainstateError::Inconsistent(
                "no immature amount at maturity height",
            ));
        };
        if *amount < value {
            return Err(ChainstateError::Inconsistent(
                "immature amount would go negative",
            ));
        }
        *amount -= value;
        if *amount == 0 {
            entry.payload.immature_amounts.remove(&maturity_height);
        }
        entry.flag = Flag::Dirty;
        Ok(())
    }

    /// Install the block's top-quality certificate for its sidechain,
    /// recording everything needed to reverse it in `block_undo`.
    pub fn update_sidechain_on_cert(
        &mut self,
        cert: &Certificate,
        block_undo: &mut BlockUndo,
    ) -> Result<(), ChainstateError> {
        let bwt_total = cert.bwt_total();

        // Called at most once per block and sidechain.
        assert!(
            block_undo
                .sc_undo_by_scid
                .get(&cert.sc_id)
                .map_or(true, |undo| hash_is_null(&undo.prev_top_cert_hash)),
            "certificate update applied twice for one block and sidechain"
        );

        if !self.have_sidechain(&cert.sc_id) {
            warn!(target: "cert", sc_id = ?cert.sc_id, "certificate for unknown sidechain");
            return Err(ChainstateError::NotFound("sidechain for certificate"));
        }

        let undo = block_undo.sc_undo_entry(&cert.sc_id);
        let entry = self.modify_sidechain(&cert.sc_id);
        let sidechain = &mut entry.payload;

        if cert.epoch_number == sidechain.last_top_quality_cert_referenced_epoch + 1 {
            undo.past_epoch_top_cert_data_hash = sidechain.past_epoch_top_quality_cert_data_hash;
            undo.content_bit_mask |= SidechainUndo::CROSS_EPOCH_CERT_DATA;
            sidechain.past_epoch_top_quality_cert_data_hash =
                sidechain.last_top_quality_cert_data_hash;
        } else if cert.epoch_number == sidechain.last_top_quality_cert_referenced_epoch {
            if cert.quality <= sidechain.last_top_quality_cert_quality {
                warn!(target: "cert", quality = cert.quality,
                    current = sidechain.last_top_quality_cert_quality,
                    "superseding certificate must have strictly higher quality");
                return Err(ChainstateError::QualityRejected);
            }
            // The superseded certificate's backward transfers return to the
            // balance before the new ones are debited.
            sidechain.balance += sidechain.last_top_quality_cert_bwt_amount;
        } else {
            warn!(target: "cert", epoch = cert.epoch_number,
                expected = sidechain.last_top_quality_cert_referenced_epoch + 1,
                "certificate epoch out of order");
            return Err(ChainstateError::Inconsistent("certificate epoch out of order"));
        }

        if sidechain.balance < bwt_total {
            warn!(target: "cert", balance = sidechain.balance, bwt_total,
                "certificate would overdraw sidechain balance");
            return Err(ChainstateError::InsufficientBalance);
        }
        sidechain.balance -= bwt_total;

        undo.prev_top_cert_hash = sidechain.last_top_quality_cert_hash;
        undo.prev_top_cert_referenced_epoch = sidechain.last_top_quality_cert_referenced_epoch;
        undo.prev_top_cert_quality = sidechain.last_top_quality_cert_quality;
        undo.prev_top_cert_bwt_amount = sidechain.last_top_quality_cert_bwt_amount;
        undo.last_top_cert_data_hash = sidechain.last_top_quality_cert_data_hash;
        undo.content_bit_mask |= SidechainUndo::ANY_EPOCH_CERT_DATA;

        sidechain.last_top_quality_cert_hash = cert.hash;
        sidechain.last_top_quality_cert_referenced_epoch = cert.epoch_number;
        sidechain.last_top_quality_cert_quality = cert.quality;
        sidechain.last_top_quality_cert_bwt_amount = bwt_total;
        sidechain.last_top_quality_cert_data_hash = cert.data_hash;

        entry.flag = Flag::Dirty;
        debug!(target: "cert", sc_id = ?cert.sc_id, epoch = cert.epoch_number,
            quality = cert.quality, "certificate connected");
        Ok(())
    }

    /// Exact reverse of [`Self::update_sidechain_on_cert`] using the saved
    /// undo payload.
    pub fn restore_sidechain_from_cert(
        &mut self,
        cert: &Certificate,
        undo: &SidechainUndo,
    ) -> Result<(), ChainstateError> {
        if !self.have_sidechain(&cert.sc_id) {
            return Err(ChainstateError::NotFound("sidechain to restore"));
        }

        let entry = self.modify_sidechain(&cert.sc_id);
        let sidechain = &mut entry.payload;

        assert_eq!(
            cert.hash, sidechain.last_top_quality_cert_hash,
            "restore must target the current top-quality certificate"
        );

        sidechain.balance += cert.bwt_total();

        if cert.epoch_number == undo.prev_top_cert_referenced_epoch + 1 {
            assert!(
                undo.content_bit_mask & SidechainUndo::CROSS_EPOCH_CERT_DATA != 0,
                "cross-epoch restore requires the cross-epoch undo section"
            );
            sidechain.last_top_quality_cert_data_hash =
                sidechain.past_epoch_top_quality_cert_data_hash;
            sidechain.past_epoch_top_quality_cert_data_hash = undo.past_epoch_top_cert_data_hash;
        } else if cert.epoch_number == undo.prev_top_cert_referenced_epoch {
            assert!(
                cert.quality > undo.prev_top_cert_quality,
                "restored predecessor must have lower quality"
            );
            sidechain.balance -= undo.prev_top_cert_bwt_amount;
        } else {
            return Err(ChainstateError::Inconsistent(
                "undo does not match certificate epoch",
            ));
        }

        assert!(
            undo.content_bit_mask & SidechainUndo::ANY_EPOCH_CERT_DATA != 0,
            "restore requires the certificate undo section"
        );
        sidechain.last_top_quality_cert_hash = undo.prev_top_cert_hash;
        sidechain.last_top_quality_cert_referenced_epoch = undo.prev_top_cert_referenced_epoch;
        sidechain.last_top_quality_cert_quality = undo.prev_top_cert_quality;
        sidechain.last_top_quality_cert_bwt_amount = undo.prev_top_cert_bwt_amount;
        sidechain.last_top_quality_cert_data_hash = undo.last_top_cert_data_hash;

        entry.flag = Flag::Dirty;
        debug!(target: "cert", sc_id = ?cert.sc_id, "certificate reverted");
        Ok(())
    }

    /// Null every backward-transfer output of the certificate's coin entry,
    /// collecting undo records; the record that prunes the entry carries its
    /// provenance.
    pub fn nullify_backward_transfers(
        &mut self,
        cert_hash: &Hash256,
        nullified: &mut Vec<OutputUndo>,
    ) {
        if hash_is_null(cert_hash) {
            return;
        }
        if !self.have_coins(cert_hash) {
            // A certificate with neither bwts nor change leaves no coins.
            debug!(target: "cert", cert = ?cert_hash, "no coins to nullify");
            return;
        }

        let mut coins = self.modify_coins(cert_hash);
        assert!(
            coins.bwt_maturity_height != 0,
            "nullify target must be a certificate entry"
        );
        let mut pos = coins.first_bwt_pos as usize;
        while pos < coins.outputs.len() {
            nullified.push(OutputUndo::from_txout(coins.outputs[pos].clone()));
            coins.spend(pos as u32);
            if coins.outputs.is_empty() {
                let record = nullified.last_mut().expect("record just pushed");
                record.is_coinbase = coins.is_coinbase;
                record.height = coins.height;
                record.version = coins.version;
                record.first_bwt_pos = coins.first_bwt_pos;
                record.bwt_maturity_height = coins.bwt_maturity_height;
            }
            pos += 1;
        }
    }

    /// Rebuild the certificate's backward transfers from undo records,
    /// iterating newest first. Inconsistencies are reported after the whole
    /// set has been examined.
    pub fn restore_backward_transfers(
        &mut self,
        cert_hash: &Hash256,
        records: &[OutputUndo],
    ) -> Result<(), ChainstateError> {
        let mut clean = true;
        let mut coins = self.modify_coins(cert_hash);

        for (idx, record) in records.iter().enumerate().rev() {
            if record.has_provenance() {
                coins.is_coinbase = record.is_coinbase;
                coins.height = record.height;
                coins.version = record.version;
                coins.first_bwt_pos = record.first_bwt_pos;
                coins.bwt_maturity_height = record.bwt_maturity_height;
            } else if coins.is_pruned() {
                warn!(target: "cert", idx, "restoring output into a missing entry");
                clean = false;
            }

            if coins.first_bwt_pos == BWT_POS_UNSET {
                warn!(target: "cert", idx, "entry has no backward-transfer section");
                clean = false;
                continue;
            }
            let pos = coins.first_bwt_pos as usize + idx;
            if coins.is_available(pos as u32) {
                warn!(target: "cert", idx, "restore would overwrite an existing output");
                clean = false;
            }
            if coins.outputs.len() < pos + 1 {
                coins.outputs.resize(pos + 1, TxOut::null());
            }
            coins.outputs[pos] = record.txout.clone();
        }
        drop(coins);

        if clean {
            Ok(())
        } else {
            Err(ChainstateError::Inconsistent(
                "backward-transfer undo data inconsistent",
            ))
        }
    }

    fn schedule_maturing_event(&mut self, sc_id: &Hash256, maturity_height: u32) {
        let entry = self.modify_sidechain_events(maturity_height);
        entry.payload.maturing_scs.insert(*sc_id);
        if entry.flag != Flag::Fresh {
            entry.flag = Flag::Dirty;
        }
    }

    fn remove_maturing_event(&mut self, sc_id: &Hash256, maturity_height: u32) {
        let entry = self.modify_sidechain_events(maturity_height);
        entry.payload.maturing_scs.remove(sc_id);
        entry.flag = if entry.payload.is_null() {
            Flag::Erased
        } else {
            Flag::Dirty
        };
    }

    fn remove_ceasing_event(&mut self, sc_id: &Hash256, ceasing_height: u32) {
        let entry = self.modify_sidechain_events(ceasing_height);
        entry.payload.ceasing_scs.remove(sc_id);
        entry.flag = if entry.payload.is_null() {
            Flag::Erased
        } else {
            Flag::Dirty
        };
    }

    fn insert_ceasing_event(&mut self, sc_id: &Hash256, ceasing_height: u32) {
        let entry = self.modify_sidechain_events(ceasing_height);
        entry.payload.ceasing_scs.insert(*sc_id);
        if entry.flag != Flag::Fresh {
            entry.flag = Flag::Dirty;
        }
    }

    /// Sidechain creation schedules its amount maturity and the first
    /// ceasing deadline.
    pub fn schedule_creation_event(
        &mut self,
        creation: &ScCreationOut,
        creation_height: u32,
    ) -> Result<(), ChainstateError> {
        let Some(sidechain) = self.access_sidechain(&creation.sc_id).cloned() else {
            warn!(target: "sc", sc_id = ?creation.sc_id, "scheduling for unknown sidechain");
            return Err(ChainstateError::NotFound("sidechain for creation event"));
        };

        let maturity_height = creation_height + self.sc_coins_maturity;
        self.schedule_maturing_event(&creation.sc_id, maturity_height);
        debug!(target: "sc", sc_id = ?creation.sc_id, maturity_height, "creation amount maturing");

        let ceasing_height = sidechain.start_height_for_epoch(1) + sidechain.safeguard_margin();
        self.insert_ceasing_event(&creation.sc_id, ceasing_height);
        debug!(target: "sc", sc_id = ?creation.sc_id, ceasing_height, "first ceasing scheduled");
        Ok(())
    }

    pub fn schedule_forward_event(
        &mut self,
        forward: &ForwardTransferOut,
        fwd_height: u32,
    ) -> Result<(), ChainstateError> {
        if !self.have_sidechain(&forward.sc_id) {
            warn!(target: "sc", sc_id = ?forward.sc_id, "scheduling for unknown sidechain");
            return Err(ChainstateError::NotFound("sidechain for forward event"));
        }
        let maturity_height = fwd_height + self.sc_coins_maturity;
        self.schedule_maturing_event(&forward.sc_id, maturity_height);
        Ok(())
    }

    pub fn schedule_bwt_request_event(
        &mut self,
        request: &BwtRequestOut,
        request_height: u32,
    ) -> Result<(), ChainstateError> {
        if !self.have_sidechain(&request.sc_id) {
            warn!(target: "sc", sc_id = ?request.sc_id, "scheduling for unknown sidechain");
            return Err(ChainstateError::NotFound("sidechain for bwt request event"));
        }
        let maturity_height = request_height + self.sc_coins_maturity;
        self.schedule_maturing_event(&request.sc_id, maturity_height);
        Ok(())
    }

    /// A connected certificate pushes the sidechain's ceasing deadline one
    /// epoch out. Finding the deadline already moved (and the next one in
    /// place) is a benign replay and succeeds.
    pub fn schedule_cert_event(&mut self, cert: &Certificate) -> Result<(), ChainstateError> {
        let Some(sidechain) = self.access_sidechain(&cert.sc_id).cloned() else {
            warn!(target: "sc", sc_id = ?cert.sc_id, "certificate event for unknown sidechain");
            return Err(ChainstateError::NotFound("sidechain for certificate event"));
        };

        let current_ceasing = sidechain.start_height_for_epoch(cert.epoch_number + 1)
            + sidechain.safeguard_margin();
        let next_ceasing = current_ceasing + sidechain.creation_data.withdrawal_epoch_length;

        if self.have_sidechain_events(current_ceasing) {
            self.remove_ceasing_event(&cert.sc_id, current_ceasing);
            debug!(target: "sc", sc_id = ?cert.sc_id, current_ceasing, "ceasing deadline cleared");
        } else {
            if !self.have_sidechain_events(next_ceasing) {
                warn!(target: "sc", sc_id = ?cert.sc_id, current_ceasing, next_ceasing,
                    "no ceasing event at either deadline");
                return Err(ChainstateError::NotFound("ceasing event to reschedule"));
            }
            debug!(target: "sc", sc_id = ?cert.sc_id, next_ceasing, "ceasing already rescheduled");
            return Ok(());
        }

        self.insert_ceasing_event(&cert.sc_id, next_ceasing);
        debug!(target: "sc", sc_id = ?cert.sc_id, next_ceasing, "ceasing deadline moved");
        Ok(())
    }

    pub fn cancel_creation_event(
        &mut self,
        creation: &ScCreationOut,
        creation_height: u32,
    ) -> Result<(), ChainstateError> {
        let Some(sidechain) = self.access_sidechain(&creation.sc_id).cloned() else {
            return Err(ChainstateError::NotFound("sidechain for creation undo"));
        };

        let maturity_height = creation_height + self.sc_coins_maturity;
        if self.have_sidechain_events(maturity_height) {
            self.remove_maturing_event(&creation.sc_id, maturity_height);
        } else {
            debug!(target: "sc", sc_id = ?creation.sc_id, maturity_height, "maturing already gone");
        }

        let ceasing_height = sidechain.start_height_for_epoch(1) + sidechain.safeguard_margin();
        if !self.have_sidechain_events(ceasing_height) {
            warn!(target: "sc", sc_id = ?creation.sc_id, ceasing_height,
                "missing ceasing event for creation undo");
            return Err(ChainstateError::NotFound("ceasing event for creation undo"));
        }
        self.remove_ceasing_event(&creation.sc_id, ceasing_height);
        Ok(())
    }

    pub fn cancel_forward_event(
        &mut self,
        forward: &ForwardTransferOut,
        fwd_height: u32,
    ) -> Result<(), ChainstateError> {
        let maturity_height = fwd_height + self.sc_coins_maturity;
        if !self.have_sidechain_events(maturity_height) {
            // Another transfer for the same height may already have removed
            // the event.
            debug!(target: "sc", sc_id = ?forward.sc_id, maturity_height, "maturing already gone");
            return Ok(());
        }
        self.remove_maturing_event(&forward.sc_id, maturity_height);
        Ok(())
    }

    pub fn cancel_bwt_request_event(
        &mut self,
        request: &BwtRequestOut,
        request_height: u32,
    ) -> Result<(), ChainstateError> {
        let maturity_height = request_height + self.sc_coins_maturity;
        if !self.have_sidechain_events(maturity_height) {
            debug!(target: "sc", sc_id = ?request.sc_id, maturity_height, "maturing already gone");
            return Ok(());
        }
        self.remove_maturing_event(&request.sc_id, maturity_height);
        Ok(())
    }

    /// Inverse of [`Self::schedule_cert_event`], applied on disconnect.
    pub fn cancel_cert_event(&mut self, cert: &Certificate) -> Result<(), ChainstateError> {
        let Some(sidechain) = self.access_sidechain(&cert.sc_id).cloned() else {
            return Err(ChainstateError::NotFound("sidechain for certificate undo"));
        };

        let current_ceasing = sidechain.start_height_for_epoch(cert.epoch_number + 2)
            + sidechain.safeguard_margin();
        let previous_ceasing =
            current_ceasing - sidechain.creation_data.withdrawal_epoch_length;

        if !self.have_sidechain_events(current_ceasing) {
            if !self.have_sidechain_events(previous_ceasing) {
                warn!(target: "sc", sc_id = ?cert.sc_id, current_ceasing, previous_ceasing,
                    "no ceasing event at either deadline");
                return Err(ChainstateError::NotFound("ceasing event for certificate undo"));
            }
            debug!(target: "sc", sc_id = ?cert.sc_id, previous_ceasing, "ceasing already restored");
            return Ok(());
        }

        self.remove_ceasing_event(&cert.sc_id, current_ceasing);
        self.insert_ceasing_event(&cert.sc_id, previous_ceasing);
        debug!(target: "sc", sc_id = ?cert.sc_id, previous_ceasing, "ceasing deadline restored");
        Ok(())
    }

    /// Apply everything scheduled at `height`: mature immature amounts and
    /// cease sidechains whose deadline passed, nullifying their top
    /// certificate's backward transfers.
    pub fn handle_sidechain_events(
        &mut self,
        height: u32,
        block_undo: &mut BlockUndo,
        mut cert_updates: Option<&mut Vec<CertStatusUpdate>>,
    ) -> Result<(), ChainstateError> {
        if !self.have_sidechain_events(height) {
            return Ok(());
        }
        let events = self
            .get_sidechain_events(height)
            .expect("events present at height");

        for sc_id in &events.maturing_scs {
            assert!(self.have_sidechain(sc_id), "maturing event for unknown sidechain");
            let undo = block_undo.sc_undo_entry(sc_id);
            let entry = self.modify_sidechain(sc_id);
            let sidechain = &mut entry.payload;
            let matured = *sidechain
                .immature_amounts
                .get(&height)
                .expect("maturing event without matching immature amount");
            sidechain.balance += matured;
            sidechain.immature_amounts.remove(&height);
            entry.flag = Flag::Dirty;

            undo.applied_matured_amount = matured;
            undo.content_bit_mask |= SidechainUndo::MATURED_AMOUNTS;
            debug!(target: "sc", sc_id = ?sc_id, height, matured, "amount matured");
        }

        for sc_id in &events.ceasing_scs {
            let sidechain = self
                .get_sidechain(sc_id)
                .expect("ceasing event for unknown sidechain");
            {
                let entry = self.modify_sidechain(sc_id);
                entry.payload.current_state = SidechainState::Ceased;
                entry.flag = Flag::Dirty;
            }
            let undo = block_undo.sc_undo_entry(sc_id);
            undo.content_bit_mask |= SidechainUndo::CEASED_CERT_DATA;
            debug!(target: "sc", sc_id = ?sc_id, height, "sidechain ceased");

            if sidechain.last_top_quality_cert_referenced_epoch == Certificate::EPOCH_NULL {
                assert!(hash_is_null(&sidechain.last_top_quality_cert_hash));
                continue;
            }

            self.nullify_backward_transfers(
                &sidechain.last_top_quality_cert_hash,
                &mut undo.ceased_bwts,
            );

            if let Some(updates) = cert_updates.as_mut() {
                updates.push(CertStatusUpdate {
                    sc_id: *sc_id,
                    cert_hash: sidechain.last_top_quality_cert_hash,
                    referenced_epoch: sidechain.last_top_quality_cert_referenced_epoch,
                    quality: sidechain.last_top_quality_cert_quality,
                    bwt_state: BwtState::Off,
                });
            }
        }

        let entry = self.modify_sidechain_events(height);
        entry.flag = Flag::Erased;
        Ok(())
    }

    /// Reverse [`Self::handle_sidechain_events`], reconstituting the event
    /// entry from the undo records.
    pub fn revert_sidechain_events(
        &mut self,
        block_undo: &BlockUndo,
        height: u32,
        mut cert_updates: Option<&mut Vec<CertStatusUpdate>>,
    ) -> Result<(), ChainstateError> {
        if self.have_sidechain_events(height) {
            warn!(target: "sc", height, "sidechain event already present at height");
            return Err(ChainstateError::Inconsistent(
                "sidechain event already present at height",
            ));
        }

        let mut recreated = SidechainEvents::default();

        for (sc_id, undo) in &block_undo.sc_undo_by_scid {
            if undo.content_bit_mask & SidechainUndo::MATURED_AMOUNTS == 0 {
                continue;
            }
            if !self.have_sidechain(sc_id) {
                return Err(ChainstateError::NotFound("sidechain for matured undo"));
            }
            let amount = undo.applied_matured_amount;
            if amount > 0 {
                let entry = self.modify_sidechain(sc_id);
                let sidechain = &mut entry.payload;
                if sidechain.balance < amount {
                    warn!(target: "sc", sc_id = ?sc_id, amount, balance = sidechain.balance,
                        "reverting matured amount would overdraw balance");
                    return Err(ChainstateError::InsufficientBalance);
                }
                *sidechain.immature_amounts.entry(height).or_insert(0) += amount;
                sidechain.balance -= amount;
                entry.flag = Flag::Dirty;
            }
            recreated.maturing_scs.insert(*sc_id);
        }

        for (sc_id, undo) in &block_undo.sc_undo_by_scid {
            if undo.content_bit_mask & SidechainUndo::CEASED_CERT_DATA == 0 {
                continue;
            }
            let sidechain = self
                .get_sidechain(sc_id)
                .ok_or(ChainstateError::NotFound("sidechain for ceased undo"))?;

            if sidechain.last_top_quality_cert_referenced_epoch != Certificate::EPOCH_NULL {
                self.restore_backward_transfers(
                    &sidechain.last_top_quality_cert_hash,
                    &undo.ceased_bwts,
                )?;
                if let Some(updates) = cert_updates.as_mut() {
                    updates.push(CertStatusUpdate {
                        sc_id: *sc_id,
                        cert_hash: sidechain.last_top_quality_cert_hash,
                        referenced_epoch: sidechain.last_top_quality_cert_referenced_epoch,
                        quality: sidechain.last_top_quality_cert_quality,
                        bwt_state: BwtState::On,
                    });
                }
            }

            recreated.ceasing_scs.insert(*sc_id);
            let entry = self.modify_sidechain(sc_id);
            entry.payload.current_state = SidechainState::Alive;
            entry.flag = Flag::Dirty;
        }

        if !recreated.is_null() {
            let entry = self.modify_sidechain_events(height);
            entry.payload = recreated;
            entry.flag = Flag::Fresh;
        }
        Ok(())
    }

    pub fn get_sidechain_state(&mut self, sc_id: &Hash256) -> SidechainState {
        match self.get_sidechain(sc_id) {
            Some(sidechain) => sidechain.current_state,
            None => SidechainState::NotApplicable,
        }
    }

    /// The certificate data hash proofs must currently bind to: before the
    /// running epoch's safeguard deadline the past epoch's hash is still
    /// active, after it the latest one is.
    pub fn get_active_cert_data_hash(
        &mut self,
        sc_id: &Hash256,
        chain: &dyn ActiveChain,
    ) -> Option<Hash256> {
        let sidechain = self.access_sidechain(sc_id)?;
        let current_height = chain.height();
        let epoch = sidechain.epoch_for(current_height);
        if epoch < 0 {
            return Some(sidechain.past_epoch_top_quality_cert_data_hash);
        }
        let safeguard_height =
            sidechain.start_height_for_epoch(epoch) + sidechain.safeguard_margin();
        if current_height < safeguard_height {
            Some(sidechain.past_epoch_top_quality_cert_data_hash)
        } else {
            Some(sidechain.last_top_quality_cert_data_hash)
        }
    }

    fn is_epoch_data_valid(
        &self,
        sidechain: &Sidechain,
        epoch_number: i32,
        end_epoch_block_hash: &Hash256,
        chain: &dyn ActiveChain,
    ) -> bool {
        if epoch_number < 0 || hash_is_null(end_epoch_block_hash) {
            debug!(target: "sc", epoch_number, "invalid epoch data");
            return false;
        }
        // With quality handling, a certificate may target the same epoch as
        // the current top; anything older is rejected.
        if epoch_number != sidechain.last_top_quality_cert_referenced_epoch
            && epoch_number != sidechain.last_top_quality_cert_referenced_epoch + 1
        {
            debug!(target: "sc", epoch_number,
                current = sidechain.last_top_quality_cert_referenced_epoch,
                "epoch not current or next");
            return false;
        }
        if !chain.contains(end_epoch_block_hash) {
            debug!(target: "sc", "end-epoch block not in active chain");
            return false;
        }
        let Some(end_epoch_height) = sidechain
            .start_height_for_epoch(epoch_number + 1)
            .checked_sub(1)
        else {
            return false;
        };
        match chain.block_hash_at(end_epoch_height) {
            Some(hash) => {
                if hash != *end_epoch_block_hash {
                    debug!(target: "sc", end_epoch_height, "end-epoch block hash mismatch");
                    return false;
                }
                true
            }
            None => {
                debug!(target: "sc", end_epoch_height, "end-epoch height beyond active chain");
                false
            }
        }
    }

    /// Full admission check for a certificate at `height`.
    pub fn is_cert_applicable(
        &mut self,
        cert: &Certificate,
        height: u32,
        verifier: &dyn ProofVerifier,
        chain: &dyn ActiveChain,
    ) -> Result<(), ChainstateError> {
        let sidechain = self
            .get_sidechain(&cert.sc_id)
            .ok_or(ChainstateError::NotFound("sidechain for certificate"))?;

        if !self.is_epoch_data_valid(&sidechain, cert.epoch_number, &cert.end_epoch_block_hash, chain)
        {
            return Err(ChainstateError::Inconsistent("invalid certificate epoch data"));
        }

        let window_start = sidechain.start_height_for_epoch(cert.epoch_number + 1);
        let window_end = window_start + sidechain.safeguard_margin();
        if height < window_start || height > window_end {
            warn!(target: "cert", height, window_start, window_end,
                "certificate outside its submission window");
            return Err(ChainstateError::Inconsistent(
                "certificate outside its submission window",
            ));
        }

        if self.get_sidechain_state(&cert.sc_id) != SidechainState::Alive {
            warn!(target: "cert", sc_id = ?cert.sc_id, "certificate for non-alive sidechain");
            return Err(ChainstateError::Inconsistent("sidechain is not alive"));
        }

        if !self.check_quality(cert) {
            return Err(ChainstateError::QualityRejected);
        }

        let bwt_total = cert.bwt_total();
        let mut available = sidechain.balance;
        if cert.epoch_number == sidechain.last_top_quality_cert_referenced_epoch {
            // Superseding the same epoch frees the incumbent's bwt amount.
            available += sidechain.last_top_quality_cert_bwt_amount;
        }
        if bwt_total > available {
            warn!(target: "cert", bwt_total, available, "certificate overdraws balance");
            return Err(ChainstateError::InsufficientBalance);
        }

        let prev_end_height = sidechain
            .start_height_for_epoch(cert.epoch_number)
            .checked_sub(1)
            .ok_or(ChainstateError::NotFound("previous end-epoch block"))?;
        let prev_end_epoch_block_hash = chain
            .block_hash_at(prev_end_height)
            .ok_or(ChainstateError::NotFound("previous end-epoch block"))?;

        if !verifier.verify_cert(
            &sidechain.creation_data.constant,
            &sidechain.creation_data.w_cert_vk,
            &prev_end_epoch_block_hash,
            cert,
        ) {
            warn!(target: "cert", cert = ?cert.hash, "certificate proof rejected");
            return Err(ChainstateError::ProofInvalid);
        }

        Ok(())
    }

    /// Admission check for a transaction's crosschain outputs.
    pub fn is_tx_applicable(
        &mut self,
        tx: &Transaction,
        verifier: &dyn ProofVerifier,
        chain: &dyn ActiveChain,
    ) -> Result<(), ChainstateError> {
        if tx.is_coinbase() {
            return Ok(());
        }

        for creation in &tx.sc_creations {
            if self.have_sidechain(&creation.sc_id) {
                warn!(target: "sc", sc_id = ?creation.sc_id, "sidechain id already taken");
                return Err(ChainstateError::Inconsistent("sidechain already created"));
            }
        }

        for forward in &tx.forward_transfers {
            if self.have_sidechain(&forward.sc_id) {
                let state = self.get_sidechain_state(&forward.sc_id);
                if state != SidechainState::Alive && state != SidechainState::Unconfirmed {
                    warn!(target: "sc", sc_id = ?forward.sc_id, "forward transfer to ceased sidechain");
                    return Err(ChainstateError::Inconsistent(
                        "forward transfer to ceased sidechain",
                    ));
                }
            } else if !tx.has_creation_for(&forward.sc_id) {
                warn!(target: "sc", sc_id = ?forward.sc_id, "forward transfer to unknown sidechain");
                return Err(ChainstateError::NotFound("sidechain for forward transfer"));
            }
        }

        for request in &tx.bwt_requests {
            if !self.have_sidechain(&request.sc_id) {
                return Err(ChainstateError::NotFound("sidechain for bwt request"));
            }
            let state = self.get_sidechain_state(&request.sc_id);
            if state != SidechainState::Alive && state != SidechainState::Unconfirmed {
                return Err(ChainstateError::Inconsistent("bwt request to ceased sidechain"));
            }
            let w_mbtr_vk = self
                .access_sidechain(&request.sc_id)
                .and_then(|sidechain| sidechain.creation_data.w_mbtr_vk.clone());
            let Some(w_mbtr_vk) = w_mbtr_vk else {
                warn!(target: "sc", sc_id = ?request.sc_id, "sidechain does not accept bwt requests");
                return Err(ChainstateError::Inconsistent(
                    "sidechain does not accept bwt requests",
                ));
            };
            let active_cert_data_hash = self
                .get_active_cert_data_hash(&request.sc_id, chain)
                .ok_or(ChainstateError::NotFound("active certificate data hash"))?;
            if !verifier.verify_bwt_request(
                &request.sc_id,
                &request.sc_request_data,
                &request.mc_destination_address,
                request.sc_fee,
                &request.sc_proof,
                &w_mbtr_vk,
                &active_cert_data_hash,
            ) {
                warn!(target: "sc", sc_id = ?request.sc_id, "bwt request proof rejected");
                return Err(ChainstateError::ProofInvalid);
            }
        }

        Ok(())
    }

    pub fn output_for(&mut self, input: &TxIn) -> Result<TxOut, ChainstateError> {
        let coins = self
            .access_coins(&input.prevout.hash)
            .ok_or(ChainstateError::NotFound("coins for input"))?;
        if !coins.is_available(input.prevout.index) {
            return Err(ChainstateError::NotFound("output for input"));
        }
        Ok(coins.outputs[input.prevout.index as usize].clone())
    }

    /// Total value a transaction brings in: transparent inputs plus the
    /// joinsplits' public value.
    pub fn value_in(&mut self, tx: &Transaction) -> Result<i64, ChainstateError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let mut total = 0i64;
        for input in &tx.vin {
            total += self.output_for(input)?.value;
        }
        total += tx.join_split_value_in();
        Ok(total)
    }

    pub fn have_inputs(&mut self, tx: &Transaction) -> bool {
        if tx.is_coinbase() {
            return true;
        }
        for input in &tx.vin {
            let available = self
                .access_coins(&input.prevout.hash)
                .is_some_and(|coins| coins.is_available(input.prevout.index));
            if !available {
                return false;
            }
        }
        true
    }

    /// Check a transaction's joinsplits: no spent nullifier, every anchor
    /// known (possibly an intermediate tree built by an earlier joinsplit of
    /// the same transaction).
    pub fn have_joinsplit_requirements(&mut self, tx: &Transaction) -> bool {
        let mut intermediates: HashMap<Hash256, CommitmentTree> = HashMap::new();
        for join_split in &tx.join_splits {
            for nullifier in &join_split.nullifiers {
                if self.get_nullifier(nullifier) {
                    return false;
                }
            }

            let mut tree = match intermediates.get(&join_split.anchor) {
                Some(tree) => tree.clone(),
                None => match self.get_anchor_at(&join_split.anchor) {
                    Some(tree) => tree,
                    None => return false,
                },
            };
            for commitment in &join_split.commitments {
                if tree.append(*commitment).is_err() {
                    return false;
                }
            }
            intermediates.insert(tree.root(), tree);
        }
        true
    }
}

impl Drop for CacheView<'_> {
    fn drop(&mut self) {
        debug_assert!(!self.has_modifier, "cache view dropped with outstanding modifier");
    }
}

impl StateView for CacheView<'_> {
    fn get_coins(&mut self, txid: &Hash256) -> Option<CoinEntry> {
        self.fetch_coins(txid).map(|entry| entry.coins.clone())
    }

    fn have_coins(&mut self, txid: &Hash256) -> bool {
        // Outputs emptiness is enough: cleanup keeps trailing nulls trimmed,
        // so a fully spent entry always has an empty vector.
        self.fetch_coins(txid)
            .is_some_and(|entry| !entry.coins.outputs.is_empty())
    }

    fn get_anchor_at(&mut self, root: &Hash256) -> Option<CommitmentTree> {
        if let Some(entry) = self.cache_anchors.get(root) {
            if entry.entered {
                return Some(entry.tree.clone());
            }
            return None;
        }
        let tree = self.base.get_anchor_at(root)?;
        self.cached_usage += tree.dynamic_memory_usage();
        self.cache_anchors.insert(
            *root,
            AnchorsCacheEntry {
                entered: true,
                tree: tree.clone(),
                flags: 0,
            },
        );
        Some(tree)
    }

    fn get_nullifier(&mut self, nullifier: &Hash256) -> bool {
        if let Some(entry) = self.cache_nullifiers.get(nullifier) {
            return entry.entered;
        }
        let entered = self.base.get_nullifier(nullifier);
        // Negative results are cached too.
        self.cache_nullifiers
            .insert(*nullifier, NullifiersCacheEntry { entered, flags: 0 });
        entered
    }

    fn get_sidechain(&mut self, sc_id: &Hash256) -> Option<Sidechain> {
        self.fetch_sidechains(sc_id)
            .filter(|entry| entry.flag != Flag::Erased)
            .map(|entry| entry.payload.clone())
    }

    fn have_sidechain(&mut self, sc_id: &Hash256) -> bool {
        self.fetch_sidechains(sc_id)
            .is_some_and(|entry| entry.flag != Flag::Erased)
    }

    fn get_sidechain_events(&mut self, height: u32) -> Option<SidechainEvents> {
        self.fetch_sidechain_events(height)
            .filter(|entry| entry.flag != Flag::Erased)
            .map(|entry| entry.payload.clone())
    }

    fn have_sidechain_events(&mut self, height: u32) -> bool {
        self.fetch_sidechain_events(height)
            .is_some_and(|entry| entry.flag != Flag::Erased)
    }

    fn get_sc_ids(&mut self, out: &mut BTreeSet<Hash256>) {
        self.base.get_sc_ids(out);
        // Overlay this layer: erased ids disappear, new ids appear.
        for (sc_id, entry) in &self.cache_sidechains {
            if entry.flag == Flag::Erased {
                out.remove(sc_id);
            } else {
                out.insert(*sc_id);
            }
        }
    }

    fn check_quality(&mut self, cert: &Certificate) -> bool {
        if let Some(sidechain) = self.get_sidechain(&cert.sc_id) {
            if sidechain.last_top_quality_cert_hash != cert.hash
                && sidechain.last_top_quality_cert_referenced_epoch == cert.epoch_number
                && sidechain.last_top_quality_cert_quality >= cert.quality
            {
                debug!(target: "cert", cert = ?cert.hash, quality = cert.quality,
                    current = sidechain.last_top_quality_cert_quality,
                    "better or equal certificate already known for this epoch");
                return false;
            }
        }
        true
    }

    fn get_best_block(&mut self) -> Hash256 {
        if hash_is_null(&self.best_block_hash) {
            self.best_block_hash = self.base.get_best_block();
        }
        self.best_block_hash
    }

    fn get_best_anchor(&mut self) -> Hash256 {
        if hash_is_null(&self.best_anchor_root) {
            self.best_anchor_root = self.base.get_best_anchor();
        }
        self.best_anchor_root
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
        assert!(!self.has_modifier, "batch write with outstanding modifier");

        for (txid, mut child) in coins.drain() {
            if child.flags & DIRTY == 0 {
                continue;
            }
            match self.cache_coins.entry(txid) {
                Entry::Vacant(slot) => {
                    if !child.coins.is_pruned() {
                        // Had the base known this coin, the child would have
                        // hydrated it through us on first read.
                        assert!(
                            child.flags & FRESH != 0,
                            "unseen non-pruned child entry must be fresh"
                        );
                        self.cached_usage += child.coins.dynamic_memory_usage();
                        child.flags = DIRTY | FRESH;
                        slot.insert(child);
                    }
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().flags & FRESH != 0 && child.coins.is_pruned() {
                        // Nothing below us has the entry either; drop it.
                        self.cached_usage = self
                            .cached_usage
                            .saturating_sub(slot.get().coins.dynamic_memory_usage());
                        slot.remove();
                    } else {
                        let entry = slot.get_mut();
                        self.cached_usage = self
                            .cached_usage
                            .saturating_sub(entry.coins.dynamic_memory_usage());
                        entry.coins = child.coins;
                        self.cached_usage += entry.coins.dynamic_memory_usage();
                        entry.flags |= DIRTY;
                    }
                }
            }
        }

        for (root, child) in anchors.drain() {
            if child.flags & DIRTY == 0 {
                continue;
            }
            match self.cache_anchors.entry(root) {
                Entry::Vacant(slot) => {
                    self.cached_usage += child.tree.dynamic_memory_usage();
                    slot.insert(AnchorsCacheEntry {
                        entered: child.entered,
                        tree: child.tree,
                        flags: DIRTY,
                    });
                }
                Entry::Occupied(mut slot) => {
                    // Only `entered` may move; this layer already holds the tree.
                    if slot.get().entered != child.entered {
                        let entry = slot.get_mut();
                        entry.entered = child.entered;
                        entry.flags |= DIRTY;
                    }
                }
            }
        }

        for (nullifier, child) in nullifiers.drain() {
            if child.flags & DIRTY == 0 {
                continue;
            }
            match self.cache_nullifiers.entry(nullifier) {
                Entry::Vacant(slot) => {
                    slot.insert(NullifiersCacheEntry {
                        entered: child.entered,
                        flags: DIRTY,
                    });
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().entered != child.entered {
                        let entry = slot.get_mut();
                        entry.entered = child.entered;
                        entry.flags |= DIRTY;
                    }
                }
            }
        }

        for (sc_id, child) in sidechains.drain() {
            write_mutable_entry(sc_id, child, &mut self.cache_sidechains)?;
        }
        for (height, child) in sidechain_events.drain() {
            write_mutable_entry(height, child, &mut self.cache_sidechain_events)?;
        }

        self.best_anchor_root = *best_anchor;
        self.best_block_hash = *best_block;
        Ok(())
    }
}

/// Scoped unique mutable access to one coin entry.
///
/// Dropping the modifier trims the entry, adjusts the usage accounting, and
/// erases entries that were fresh in this layer and ended up pruned.
pub struct CoinsModifier<'c, 'a> {
    cache: &'c mut CacheView<'a>,
    txid: Hash256,
    old_usage: usize,
}

impl Deref for CoinsModifier<'_, '_> {
    type Target = CoinEntry;

    fn deref(&self) -> &CoinEntry {
        &self.cache.cache_coins[&self.txid].coins
    }
}

impl DerefMut for CoinsModifier<'_, '_> {
    fn deref_mut(&mut self) -> &mut CoinEntry {
        &mut self
            .cache
            .cache_coins
            .get_mut(&self.txid)
            .expect("modifier entry present")
            .coins
    }
}

impl Drop for CoinsModifier<'_, '_> {
    fn drop(&mut self) {
        assert!(self.cache.has_modifier, "modifier latch already released");
        self.cache.has_modifier = false;

        let erase = {
            let entry = self
                .cache
                .cache_coins
                .get_mut(&self.txid)
                .expect("modifier entry present");
            entry.coins.cleanup();
            entry.flags & FRESH != 0 && entry.coins.is_pruned()
        };
        self.cache.cached_usage = self.cache.cached_usage.saturating_sub(self.old_usage);
        if erase {
            self.cache.cache_coins.remove(&self.txid);
        } else if let Some(entry) = self.cache.cache_coins.get(&self.txid) {
            self.cache.cached_usage += entry.coins.dynamic_memory_usage();
        }
    }
}
