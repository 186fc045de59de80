//! Per-transaction coin entries: the unspent output bundle plus provenance.
//!
//! Spent positions are null outputs; trailing nulls are always trimmed, so a
//! fully spent entry ends up with an empty output vector (pruned).

use zephyrd_consensus::{is_cert_version, COINBASE_MATURITY};
use zephyrd_primitives::compress::{
    compress_amount, decompress_amount, read_compressed_script, write_compressed_script,
};
use zephyrd_primitives::encoding::{DecodeError, Decoder, Encoder};
use zephyrd_primitives::{Certificate, Transaction, TxOut};

/// `first_bwt_pos` value for entries that did not originate from a certificate.
pub const BWT_POS_UNSET: u32 = u32::MAX;

#[derive(Clone, Debug)]
pub struct CoinEntry {
    pub is_coinbase: bool,
    pub outputs: Vec<TxOut>,
    pub height: u32,
    pub version: i32,
    pub first_bwt_pos: u32,
    pub bwt_maturity_height: u32,
}

impl Default for CoinEntry {
    fn default() -> Self {
        Self {
            is_coinbase: false,
            outputs: Vec::new(),
            height: 0,
            version: 0,
            first_bwt_pos: BWT_POS_UNSET,
            bwt_maturity_height: 0,
        }
    }
}

impl CoinEntry {
    pub fn from_transaction(tx: &Transaction, height: u32) -> Self {
        let mut entry = Self {
            is_coinbase: tx.is_coinbase(),
            outputs: tx.vout.clone(),
            height,
            version: tx.version,
            first_bwt_pos: BWT_POS_UNSET,
            bwt_maturity_height: 0,
        };
        entry.clear_unspendable();
        entry
    }

    pub fn from_certificate(
        cert: &Certificate,
        height: u32,
        bwt_maturity_height: u32,
        is_block_top_quality: bool,
    ) -> Self {
        let mut entry = Self {
            is_coinbase: false,
            outputs: cert.vout.clone(),
            height,
            version: cert.version,
            first_bwt_pos: cert.first_bwt_pos,
            bwt_maturity_height,
        };
        if !is_block_top_quality {
            // A superseded certificate keeps its change outputs only.
            let mut pos = cert.first_bwt_pos;
            while (pos as usize) < entry.outputs.len() {
                entry.spend(pos);
                pos += 1;
            }
        }
        entry.clear_unspendable();
        entry
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Trim trailing null outputs; an empty vector drops its capacity.
    pub fn cleanup(&mut self) {
        while self.outputs.last().is_some_and(TxOut::is_null) {
            self.outputs.pop();
        }
        if self.outputs.is_empty() {
            self.outputs = Vec::new();
        }
    }

    pub fn clear_unspendable(&mut self) {
        for out in &mut self.outputs {
            if out.is_unspendable() {
                out.set_null();
            }
        }
        self.cleanup();
    }

    pub fn spend(&mut self, pos: u32) -> bool {
        let idx = pos as usize;
        if idx >= self.outputs.len() || self.outputs[idx].is_null() {
            return false;
        }
        self.outputs[idx].set_null();
        self.cleanup();
        true
    }

    pub fn is_available(&self, pos: u32) -> bool {
        let idx = pos as usize;
        idx < self.outputs.len() && !self.outputs[idx].is_null()
    }

    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(TxOut::is_null)
    }

    pub fn is_from_cert(&self) -> bool {
        is_cert_version(self.version)
    }

    pub fn is_output_mature(&self, pos: u32, spending_height: u32) -> bool {
        if !self.is_coinbase && !self.is_from_cert() {
            return true;
        }
        if self.is_coinbase {
            return spending_height >= self.height + COINBASE_MATURITY;
        }
        // Certificate entry: backward transfers wait for their maturity
        // height, change positions are immediately spendable.
        if pos >= self.first_bwt_pos {
            spending_height >= self.bwt_maturity_height
        } else {
            true
        }
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        let mut usage = self.outputs.capacity() * std::mem::size_of::<TxOut>();
        for out in &self.outputs {
            usage += out.script_pubkey.capacity();
        }
        usage
    }

    /// Availability mask geometry for outputs at position 2 and beyond:
    /// number of mask bytes up to the last used one, and how many of those
    /// are non-zero.
    pub fn calc_mask_size(&self) -> (usize, usize) {
        let mut bytes = 0usize;
        let mut nonzero = 0usize;
        let mut chunk = 0usize;
        while 2 + chunk * 8 < self.outputs.len() {
            let mut zero = true;
            for bit in 0..8 {
                let pos = 2 + chunk * 8 + bit;
                if pos < self.outputs.len() && !self.outputs[pos].is_null() {
                    zero = false;
                }
            }
            if !zero {
                bytes = chunk + 1;
                nonzero += 1;
            }
            chunk += 1;
        }
        (bytes, nonzero)
    }

    /// Compressed on-disk form. The version survives only in its low 7 bits,
    /// which is enough for the certificate-origin test.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(!self.is_pruned(), "pruned entries are erased, not stored");
        let (mask_bytes, mask_code) = self.calc_mask_size();
        let first = self.outputs.first().is_some_and(|out| !out.is_null());
        let second = self.outputs.get(1).is_some_and(|out| !out.is_null());
        let code = 8 * (mask_code as u64 - u64::from(!first && !second))
            + u64::from(self.is_coinbase)
            + if first { 2 } else { 0 }
            + if second { 4 } else { 0 };

        let mut encoder = Encoder::new();
        encoder.write_varint((self.version & 0x7f) as u64);
        encoder.write_varint(code);
        for chunk in 0..mask_bytes {
            let mut avail = 0u8;
            for bit in 0..8 {
                let pos = 2 + chunk * 8 + bit;
                if pos < self.outputs.len() && !self.outputs[pos].is_null() {
                    avail |= 1 << bit;
                }
            }
            encoder.write_u8(avail);
        }
        for out in &self.outputs {
            if !out.is_null() {
                encoder.write_varint(compress_amount(out.value as u64));
                write_compressed_script(&mut encoder, &out.script_pubkey);
            }
        }
        encoder.write_varint(u64::from(self.height));
        if self.is_from_cert() {
            encoder.write_u32_le(self.first_bwt_pos);
            encoder.write_u32_le(self.bwt_maturity_height);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_varint()? as i32;
        let code = decoder.read_varint()?;
        let is_coinbase = code & 1 != 0;
        let mut avail = vec![code & 2 != 0, code & 4 != 0];
        let mut mask_code = code / 8 + u64::from(code & 6 == 0);
        while mask_code > 0 {
            let chunk = decoder.read_u8()?;
            for bit in 0..8 {
                avail.push(chunk & (1 << bit) != 0);
            }
            if chunk != 0 {
                mask_code -= 1;
            }
        }

        let mut outputs = vec![TxOut::null(); avail.len()];
        for (pos, available) in avail.iter().enumerate() {
            if *available {
                let value = decompress_amount(decoder.read_varint()?) as i64;
                let script = read_compressed_script(&mut decoder)?;
                outputs[pos] = TxOut::new(value, script);
            }
        }
        let height = decoder.read_varint()? as u32;
        let (first_bwt_pos, bwt_maturity_height) = if is_cert_version(version) {
            (decoder.read_u32_le()?, decoder.read_u32_le()?)
        } else {
            (BWT_POS_UNSET, 0)
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }

        let mut entry = Self {
            is_coinbase,
            outputs,
            height,
            version,
            first_bwt_pos,
            bwt_maturity_height,
        };
        entry.cleanup();
        Ok(entry)
    }
}

impl PartialEq for CoinEntry {
    fn eq(&self, other: &Self) -> bool {
        // Pruned entries are behaviorally absent and always compare equal.
        if self.is_pruned() && other.is_pruned() {
            return true;
        }
        self.is_coinbase == other.is_coinbase
            && self.height == other.height
            && self.version == other.version
            && self.outputs == other.outputs
            && self.first_bwt_pos == other.first_bwt_pos
            && self.bwt_maturity_height == other.bwt_maturity_height
    }
}

impl Eq for CoinEntry {}
