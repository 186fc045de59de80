//! Transaction, certificate and crosschain-output types.
//!
//! Parsing, hashing and signature checking happen upstream; these types carry
//! their ids as plain fields and only expose the accessors the chain-state
//! layer needs.

use zephyrd_consensus::{Hash256, MAX_SCRIPT_SIZE, SC_CERT_VERSION};

use crate::outpoint::OutPoint;

const OP_RETURN: u8 = 0x6a;

/// A transaction output. The null output (value -1, empty script) marks a
/// spent position inside a coin entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    pub fn null() -> Self {
        Self {
            value: -1,
            script_pubkey: Vec::new(),
        }
    }

    pub fn set_null(&mut self) {
        self.value = -1;
        self.script_pubkey = Vec::new();
    }

    pub fn is_null(&self) -> bool {
        self.value == -1 && self.script_pubkey.is_empty()
    }

    /// Provably unspendable outputs are dropped from coin entries on creation.
    pub fn is_unspendable(&self) -> bool {
        self.script_pubkey.first() == Some(&OP_RETURN)
            || self.script_pubkey.len() > MAX_SCRIPT_SIZE
    }
}

impl Default for TxOut {
    fn default() -> Self {
        Self::null()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        Self { prevout }
    }
}

/// A shielded-pool fragment: spends notes under `anchor`, revealing
/// `nullifiers` and appending `commitments`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JoinSplit {
    /// Value leaving the transparent pool into the shielded pool.
    pub vpub_old: i64,
    /// Value entering the transparent pool from the shielded pool.
    pub vpub_new: i64,
    pub anchor: Hash256,
    pub nullifiers: Vec<Hash256>,
    pub commitments: Vec<Hash256>,
}

/// Sidechain declaration output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScCreationOut {
    pub sc_id: Hash256,
    pub value: i64,
    pub withdrawal_epoch_length: u32,
    pub custom_data: Vec<u8>,
    pub constant: Vec<u8>,
    pub w_cert_vk: Vec<u8>,
    pub w_mbtr_vk: Option<Vec<u8>>,
}

/// Mainchain-to-sidechain transfer output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForwardTransferOut {
    pub sc_id: Hash256,
    pub value: i64,
}

/// Mainchain backward-transfer request output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BwtRequestOut {
    pub sc_id: Hash256,
    pub sc_request_data: Vec<u8>,
    pub mc_destination_address: Vec<u8>,
    pub sc_fee: i64,
    pub sc_proof: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Transaction {
    pub hash: Hash256,
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub join_splits: Vec<JoinSplit>,
    pub sc_creations: Vec<ScCreationOut>,
    pub forward_transfers: Vec<ForwardTransferOut>,
    pub bwt_requests: Vec<BwtRequestOut>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// Total value the joinsplits release into the transparent pool.
    pub fn join_split_value_in(&self) -> i64 {
        self.join_splits.iter().map(|js| js.vpub_new).sum()
    }

    pub fn has_creation_for(&self, sc_id: &Hash256) -> bool {
        self.sc_creations.iter().any(|cr| cr.sc_id == *sc_id)
    }
}

/// A sidechain certificate: commits epoch results with a quality score and
/// carries backward transfers as the output tail starting at `first_bwt_pos`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Certificate {
    pub hash: Hash256,
    pub version: i32,
    pub sc_id: Hash256,
    pub epoch_number: i32,
    pub quality: i64,
    pub end_epoch_block_hash: Hash256,
    pub data_hash: Hash256,
    pub vout: Vec<TxOut>,
    pub first_bwt_pos: u32,
}

impl Certificate {
    pub const EPOCH_NULL: i32 = -1;
    pub const QUALITY_NULL: i64 = -1;

    pub fn new(sc_id: Hash256, hash: Hash256) -> Self {
        Self {
            hash,
            version: SC_CERT_VERSION,
            sc_id,
            epoch_number: Self::EPOCH_NULL,
            quality: Self::QUALITY_NULL,
            end_epoch_block_hash: [0u8; 32],
            data_hash: [0u8; 32],
            vout: Vec::new(),
            first_bwt_pos: 0,
        }
    }

    /// Total value of the backward-transfer outputs.
    pub fn bwt_total(&self) -> i64 {
        self.vout
            .iter()
            .skip(self.first_bwt_pos as usize)
            .map(|out| out.value)
            .sum()
    }
}
