//! Durable view at the bottom of the stack, backed by a key-value store.
//!
//! One upward flush becomes one write batch: dirty coins are written (or
//! deleted once pruned), erased sidechain and event entries are deleted,
//! anchors and nullifiers follow their `entered` flag.

use std::collections::BTreeSet;

use tracing::error;
use zephyrd_consensus::{hash_is_null, Hash256, NULL_HASH};
use zephyrd_storage::{Column, KeyValueStore, WriteBatch};

use crate::cache::{
    AnchorsMap, CoinsMap, Flag, NullifiersMap, SidechainEventsMap, SidechainsMap, DIRTY,
};
use crate::coins::CoinEntry;
use crate::commitment::CommitmentTree;
use crate::error::ChainstateError;
use crate::sidechain::{Sidechain, SidechainEvents};
use crate::view::{CoinsStats, StateView};

const META_BEST_BLOCK: &[u8] = b"best_block";
const META_BEST_ANCHOR: &[u8] = b"best_anchor";

pub struct StoreView<S> {
    store: S,
}

impl<S: KeyValueStore> StoreView<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn read(&self, column: Column, key: &[u8]) -> Option<Vec<u8>> {
        match self.store.get(column, key) {
            Ok(value) => value,
            Err(err) => {
                error!(target: "store", %err, ?column, "store read failed");
                None
            }
        }
    }
}

impl<S: KeyValueStore> StateView for StoreView<S> {
    fn get_coins(&mut self, txid: &Hash256) -> Option<CoinEntry> {
        let bytes = self.read(Column::Coins, txid)?;
        match CoinEntry::decode(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!(target: "store", %err, "corrupt coin entry");
                None
            }
        }
    }

    fn have_coins(&mut self, txid: &Hash256) -> bool {
        self.read(Column::Coins, txid).is_some()
    }

    fn get_anchor_at(&mut self, root: &Hash256) -> Option<CommitmentTree> {
        let bytes = self.read(Column::Anchors, root)?;
        match CommitmentTree::decode(&bytes) {
            Ok(tree) => Some(tree),
            Err(err) => {
                error!(target: "store", %err, "corrupt anchor entry");
                None
            }
        }
    }

    fn get_nullifier(&mut self, nullifier: &Hash256) -> bool {
        self.read(Column::Nullifiers, nullifier).is_some()
    }

    fn get_sidechain(&mut self, sc_id: &Hash256) -> Option<Sidechain> {
        let bytes = self.read(Column::Sidechains, sc_id)?;
        match Sidechain::decode(&bytes) {
            Ok(sidechain) => Some(sidechain),
            Err(err) => {
                error!(target: "store", %err, "corrupt sidechain entry");
                None
            }
        }
    }

    fn have_sidechain(&mut self, sc_id: &Hash256) -> bool {
        self.read(Column::Sidechains, sc_id).is_some()
    }

    fn get_sidechain_events(&mut self, height: u32) -> Option<SidechainEvents> {
        let bytes = self.read(Column::SidechainEvents, &height.to_be_bytes())?;
        match SidechainEvents::decode(&bytes) {
            Ok(events) => Some(events),
            Err(err) => {
                error!(target: "store", %err, "corrupt sidechain event entry");
                None
            }
        }
    }

    fn have_sidechain_events(&mut self, height: u32) -> bool {
        self.read(Column::SidechainEvents, &height.to_be_bytes())
            .is_some()
    }

    fn get_sc_ids(&mut self, out: &mut BTreeSet<Hash256>) {
        out.clear();
        let result = self.store.for_each_prefix(Column::Sidechains, &[], &mut |key, _value| {
            if let Ok(sc_id) = <[u8; 32]>::try_from(key) {
                out.insert(sc_id);
            }
            Ok(())
        });
        if let Err(err) = result {
            error!(target: "store", %err, "sidechain id scan failed");
        }
    }

    fn get_best_block(&mut self) -> Hash256 {
        self.read(Column::Meta, META_BEST_BLOCK)
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
            .unwrap_or(NULL_HASH)
    }

    fn get_best_anchor(&mut self) -> Hash256 {
        self.read(Column::Meta, META_BEST_ANCHOR)
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
            .unwrap_or(NULL_HASH)
    }

    fn get_stats(&mut self) -> Option<CoinsStats> {
        let mut stats = CoinsStats::default();
        let mut clean = true;
        let result = self.store.for_each_prefix(Column::Coins, &[], &mut |_key, value| {
            match CoinEntry::decode(value) {
                Ok(entry) => {
                    stats.coins += 1;
                    for out in &entry.outputs {
                        if !out.is_null() {
                            stats.outputs += 1;
                            stats.total_amount += out.value;
                        }
                    }
                }
                Err(err) => {
                    error!(target: "store", %err, "corrupt coin entry in stats scan");
                    clean = false;
                }
            }
            Ok(())
        });
        if result.is_err() || !clean {
            return None;
        }
        Some(stats)
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
        let mut batch = WriteBatch::new();

        for (txid, entry) in coins.drain() {
            if entry.flags & DIRTY == 0 {
                continue;
            }
            if entry.coins.is_pruned() {
                batch.delete(Column::Coins, txid);
            } else {
                batch.put(Column::Coins, txid, entry.coins.encode());
            }
        }

        for (root, entry) in anchors.drain() {
            if entry.flags & DIRTY == 0 {
                continue;
            }
            if entry.entered {
                batch.put(Column::Anchors, root, entry.tree.encode());
            } else {
                batch.delete(Column::Anchors, root);
            }
        }

        for (nullifier, entry) in nullifiers.drain() {
            if entry.flags & DIRTY == 0 {
                continue;
            }
            if entry.entered {
                batch.put(Column::Nullifiers, nullifier, Vec::new());
            } else {
                batch.delete(Column::Nullifiers, nullifier);
            }
        }

        for (sc_id, entry) in sidechains.drain() {
            match entry.flag {
                Flag::Default => {}
                Flag::Fresh | Flag::Dirty => {
                    batch.put(Column::Sidechains, sc_id, entry.payload.encode());
                }
                Flag::Erased => batch.delete(Column::Sidechains, sc_id),
            }
        }

        for (height, entry) in sidechain_events.drain() {
            match entry.flag {
                Flag::Default => {}
                Flag::Fresh | Flag::Dirty => {
                    batch.put(
                        Column::SidechainEvents,
                        height.to_be_bytes(),
                        entry.payload.encode(),
                    );
                }
                Flag::Erased => batch.delete(Column::SidechainEvents, height.to_be_bytes()),
            }
        }

        if !hash_is_null(best_block) {
            batch.put(Column::Meta, META_BEST_BLOCK, best_block.to_vec());
        }
        if !hash_is_null(best_anchor) {
            batch.put(Column::Meta, META_BEST_ANCHOR, best_anchor.to_vec());
        }

        self.store.write_batch(&batch)?;
        Ok(())
    }
}
