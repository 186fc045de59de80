//! Undo data recorded at block connect, sufficient to reverse it exactly.

use std::collections::BTreeMap;

use zephyrd_consensus::{is_cert_version, Hash256, MAX_BLOCK_SIZE, MIN_TX_SIZE};
use zephyrd_primitives::compress::{
    compress_amount, decompress_amount, read_compressed_script, write_compressed_script,
};
use zephyrd_primitives::encoding::{DecodeError, Decoder, Encoder};
use zephyrd_primitives::{Certificate, TxOut};

use crate::coins::BWT_POS_UNSET;

/// Undo record for one spent output.
///
/// When the spend pruned the whole coin entry, the record also carries the
/// entry's provenance (`height != 0` marks that case).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputUndo {
    pub txout: TxOut,
    pub is_coinbase: bool,
    pub height: u32,
    pub version: i32,
    pub first_bwt_pos: u32,
    pub bwt_maturity_height: u32,
}

impl Default for OutputUndo {
    fn default() -> Self {
        Self {
            txout: TxOut::null(),
            is_coinbase: false,
            height: 0,
            version: 0,
            first_bwt_pos: BWT_POS_UNSET,
            bwt_maturity_height: 0,
        }
    }
}

impl OutputUndo {
    pub fn from_txout(txout: TxOut) -> Self {
        Self {
            txout,
            ..Default::default()
        }
    }

    pub fn has_provenance(&self) -> bool {
        self.height != 0
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_varint(u64::from(self.height) * 2 + u64::from(self.is_coinbase));
        if self.height > 0 {
            encoder.write_varint(u64::from(self.version as u32));
        }
        if self.txout.is_null() {
            encoder.write_u8(0);
        } else {
            encoder.write_u8(1);
            encoder.write_varint(compress_amount(self.txout.value as u64));
            write_compressed_script(encoder, &self.txout.script_pubkey);
        }
        if self.height > 0 && is_cert_version(self.version) {
            encoder.write_u32_le(self.first_bwt_pos);
            encoder.write_u32_le(self.bwt_maturity_height);
        }
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let code = decoder.read_varint()?;
        let height = (code / 2) as u32;
        let is_coinbase = code & 1 != 0;
        let version = if height > 0 {
            decoder.read_varint()? as u32 as i32
        } else {
            0
        };
        let txout = if decoder.read_bool()? {
            let value = decompress_amount(decoder.read_varint()?) as i64;
            let script = read_compressed_script(decoder)?;
            TxOut::new(value, script)
        } else {
            TxOut::null()
        };
        let (first_bwt_pos, bwt_maturity_height) = if height > 0 && is_cert_version(version) {
            (decoder.read_u32_le()?, decoder.read_u32_le()?)
        } else {
            (BWT_POS_UNSET, 0)
        };
        Ok(Self {
            txout,
            is_coinbase,
            height,
            version,
            first_bwt_pos,
            bwt_maturity_height,
        })
    }
}

/// Undo records for all inputs of one transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub prevouts: Vec<OutputUndo>,
}

impl TxUndo {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_compact_size(self.prevouts.len() as u64);
        for prevout in &self.prevouts {
            prevout.encode_into(encoder);
        }
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = decoder.read_compact_size()?;
        let mut prevouts = Vec::new();
        for _ in 0..count {
            prevouts.push(OutputUndo::decode_from(decoder)?);
        }
        Ok(Self { prevouts })
    }
}

/// Per-sidechain undo payload, with a bitmask describing which sections the
/// connect actually filled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidechainUndo {
    pub content_bit_mask: u8,
    pub prev_top_cert_hash: Hash256,
    pub prev_top_cert_referenced_epoch: i32,
    pub prev_top_cert_quality: i64,
    pub prev_top_cert_bwt_amount: i64,
    pub last_top_cert_data_hash: Hash256,
    pub past_epoch_top_cert_data_hash: Hash256,
    pub applied_matured_amount: i64,
    pub superseded_bwts: Vec<OutputUndo>,
    pub ceased_bwts: Vec<OutputUndo>,
}

impl Default for SidechainUndo {
    fn default() -> Self {
        Self {
            content_bit_mask: 0,
            prev_top_cert_hash: [0u8; 32],
            prev_top_cert_referenced_epoch: Certificate::EPOCH_NULL,
            prev_top_cert_quality: Certificate::QUALITY_NULL,
            prev_top_cert_bwt_amount: 0,
            last_top_cert_data_hash: [0u8; 32],
            past_epoch_top_cert_data_hash: [0u8; 32],
            applied_matured_amount: 0,
            superseded_bwts: Vec::new(),
            ceased_bwts: Vec::new(),
        }
    }
}

impl SidechainUndo {
    /// Previous top-certificate identifiers are present.
    pub const ANY_EPOCH_CERT_DATA: u8 = 0x01;
    /// A matured amount was applied at this height.
    pub const MATURED_AMOUNTS: u8 = 0x02;
    /// The certificate advanced the epoch; the past-epoch data hash was
    /// rotated.
    pub const CROSS_EPOCH_CERT_DATA: u8 = 0x04;
    /// The sidechain ceased at this height.
    pub const CEASED_CERT_DATA: u8 = 0x08;
    /// A same-epoch supersession nullified the previous top certificate's
    /// backward transfers.
    pub const SUPERSEDED_CERT_DATA: u8 = 0x10;

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.content_bit_mask);
        if self.content_bit_mask & Self::ANY_EPOCH_CERT_DATA != 0 {
            encoder.write_bytes(&self.prev_top_cert_hash);
            encoder.write_i32_le(self.prev_top_cert_referenced_epoch);
            encoder.write_i64_le(self.prev_top_cert_quality);
            encoder.write_i64_le(self.prev_top_cert_bwt_amount);
            encoder.write_bytes(&self.last_top_cert_data_hash);
        }
        if self.content_bit_mask & Self::MATURED_AMOUNTS != 0 {
            encoder.write_i64_le(self.applied_matured_amount);
        }
        if self.content_bit_mask & Self::CROSS_EPOCH_CERT_DATA != 0 {
            encoder.write_bytes(&self.past_epoch_top_cert_data_hash);
        }
        if self.content_bit_mask & Self::SUPERSEDED_CERT_DATA != 0 {
            encoder.write_compact_size(self.superseded_bwts.len() as u64);
            for undo in &self.superseded_bwts {
                undo.encode_into(encoder);
            }
        }
        if self.content_bit_mask & Self::CEASED_CERT_DATA != 0 {
            encoder.write_compact_size(self.ceased_bwts.len() as u64);
            for undo in &self.ceased_bwts {
                undo.encode_into(encoder);
            }
        }
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut undo = Self {
            content_bit_mask: decoder.read_u8()?,
            ..Default::default()
        };
        if undo.content_bit_mask & Self::ANY_EPOCH_CERT_DATA != 0 {
            undo.prev_top_cert_hash = decoder.read_fixed::<32>()?;
            undo.prev_top_cert_referenced_epoch = decoder.read_i32_le()?;
            undo.prev_top_cert_quality = decoder.read_i64_le()?;
            undo.prev_top_cert_bwt_amount = decoder.read_i64_le()?;
            undo.last_top_cert_data_hash = decoder.read_fixed::<32>()?;
        }
        if undo.content_bit_mask & Self::MATURED_AMOUNTS != 0 {
            undo.applied_matured_amount = decoder.read_i64_le()?;
        }
        if undo.content_bit_mask & Self::CROSS_EPOCH_CERT_DATA != 0 {
            undo.past_epoch_top_cert_data_hash = decoder.read_fixed::<32>()?;
        }
        if undo.content_bit_mask & Self::SUPERSEDED_CERT_DATA != 0 {
            let count = decoder.read_compact_size()?;
            for _ in 0..count {
                undo.superseded_bwts.push(OutputUndo::decode_from(decoder)?);
            }
        }
        if undo.content_bit_mask & Self::CEASED_CERT_DATA != 0 {
            let count = decoder.read_compact_size()?;
            for _ in 0..count {
                undo.ceased_bwts.push(OutputUndo::decode_from(decoder)?);
            }
        }
        Ok(undo)
    }
}

/// Compact size sentinel distinguishing sidechain-aware block undo data from
/// the legacy layout, which leads with the transaction-undo count. Must stay
/// above the largest feasible transaction count in a block.
pub const BLOCK_UNDO_MARKER: u16 = 0xffff;

const _: () = assert!(BLOCK_UNDO_MARKER as u32 > MAX_BLOCK_SIZE / MIN_TX_SIZE);

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub tx_undos: Vec<TxUndo>,
    pub old_tree_root: Hash256,
    pub sc_undo_by_scid: BTreeMap<Hash256, SidechainUndo>,
}

impl BlockUndo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for a sidechain, created on first touch.
    pub fn sc_undo_entry(&mut self, sc_id: &Hash256) -> &mut SidechainUndo {
        self.sc_undo_by_scid.entry(*sc_id).or_default()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(u64::from(BLOCK_UNDO_MARKER));
        encoder.write_compact_size(self.tx_undos.len() as u64);
        for tx_undo in &self.tx_undos {
            tx_undo.encode_into(&mut encoder);
        }
        encoder.write_bytes(&self.old_tree_root);
        encoder.write_compact_size(self.sc_undo_by_scid.len() as u64);
        for (sc_id, undo) in &self.sc_undo_by_scid {
            encoder.write_bytes(sc_id);
            undo.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    /// Decodes both layouts. Returns the undo data and whether it carried
    /// the sidechain sections (legacy data does not).
    pub fn decode(bytes: &[u8]) -> Result<(Self, bool), DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut undo = Self::default();

        let lead = decoder.read_compact_size()?;
        let includes_sidechain_data = lead == u64::from(BLOCK_UNDO_MARKER);
        let tx_count = if includes_sidechain_data {
            decoder.read_compact_size()?
        } else {
            lead
        };
        for _ in 0..tx_count {
            undo.tx_undos.push(TxUndo::decode_from(&mut decoder)?);
        }
        undo.old_tree_root = decoder.read_fixed::<32>()?;
        if includes_sidechain_data {
            let sc_count = decoder.read_compact_size()?;
            for _ in 0..sc_count {
                let sc_id = decoder.read_fixed::<32>()?;
                undo.sc_undo_by_scid
                    .insert(sc_id, SidechainUndo::decode_from(&mut decoder)?);
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok((undo, includes_sidechain_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zephyrd_consensus::SC_CERT_VERSION;

    fn sample_undo() -> BlockUndo {
        let mut undo = BlockUndo::new();
        undo.old_tree_root = [0x42; 32];
        undo.tx_undos.push(TxUndo {
            prevouts: vec![
                OutputUndo::from_txout(TxOut::new(50, vec![0x51])),
                OutputUndo {
                    txout: TxOut::new(25, vec![0x52]),
                    is_coinbase: true,
                    height: 120,
                    version: 1,
                    ..Default::default()
                },
            ],
        });
        let sc_undo = undo.sc_undo_entry(&[0x07; 32]);
        sc_undo.content_bit_mask = SidechainUndo::ANY_EPOCH_CERT_DATA
            | SidechainUndo::MATURED_AMOUNTS
            | SidechainUndo::CEASED_CERT_DATA;
        sc_undo.prev_top_cert_hash = [0x08; 32];
        sc_undo.prev_top_cert_referenced_epoch = 3;
        sc_undo.prev_top_cert_quality = 11;
        sc_undo.prev_top_cert_bwt_amount = 90;
        sc_undo.last_top_cert_data_hash = [0x09; 32];
        sc_undo.applied_matured_amount = 77;
        sc_undo.ceased_bwts.push(OutputUndo {
            txout: TxOut::new(30, vec![0x53]),
            height: 130,
            version: SC_CERT_VERSION,
            first_bwt_pos: 1,
            bwt_maturity_height: 160,
            ..Default::default()
        });
        undo
    }

    #[test]
    fn marker_roundtrip() {
        let undo = sample_undo();
        let bytes = undo.encode();
        let (decoded, includes_sidechain_data) = BlockUndo::decode(&bytes).expect("decode");
        assert!(includes_sidechain_data);
        assert_eq!(decoded, undo);
    }

    #[test]
    fn legacy_layout_is_still_readable() {
        // Legacy data leads with the tx-undo count instead of the marker.
        let mut encoder = Encoder::new();
        encoder.write_compact_size(1);
        TxUndo {
            prevouts: vec![OutputUndo::from_txout(TxOut::new(10, vec![0x51]))],
        }
        .encode_into(&mut encoder);
        encoder.write_bytes(&[0x21; 32]);
        let bytes = encoder.into_inner();

        let (decoded, includes_sidechain_data) = BlockUndo::decode(&bytes).expect("decode");
        assert!(!includes_sidechain_data);
        assert_eq!(decoded.tx_undos.len(), 1);
        assert_eq!(decoded.old_tree_root, [0x21; 32]);
        assert!(decoded.sc_undo_by_scid.is_empty());
    }

    #[test]
    fn provenance_record_roundtrips_cert_fields() {
        let record = OutputUndo {
            txout: TxOut::new(5, vec![0x51]),
            is_coinbase: false,
            height: 300,
            version: SC_CERT_VERSION,
            first_bwt_pos: 2,
            bwt_maturity_height: 345,
        };
        let mut encoder = Encoder::new();
        record.encode_into(&mut encoder);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        let decoded = OutputUndo::decode_from(&mut decoder).expect("decode");
        assert!(decoder.is_empty());
        assert_eq!(decoded, record);
        assert!(decoded.has_provenance());
    }
}
