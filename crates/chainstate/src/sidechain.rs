//! Sidechain records, lifecycle state and height-indexed event schedules.

use std::collections::{BTreeMap, BTreeSet};

use zephyrd_consensus::Hash256;
use zephyrd_primitives::encoding::{DecodeError, Decoder, Encoder};
use zephyrd_primitives::Certificate;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SidechainState {
    /// Known only to the mempool layer, not yet in a block.
    Unconfirmed,
    Alive,
    Ceased,
    /// No such sidechain.
    NotApplicable,
}

impl SidechainState {
    fn to_u8(self) -> u8 {
        match self {
            SidechainState::Unconfirmed => 0,
            SidechainState::Alive => 1,
            SidechainState::Ceased => 2,
            SidechainState::NotApplicable => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(SidechainState::Unconfirmed),
            1 => Ok(SidechainState::Alive),
            2 => Ok(SidechainState::Ceased),
            3 => Ok(SidechainState::NotApplicable),
            _ => Err(DecodeError::Unsupported("sidechain state")),
        }
    }
}

/// Parameters fixed at sidechain declaration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SidechainCreationData {
    pub withdrawal_epoch_length: u32,
    pub custom_data: Vec<u8>,
    pub constant: Vec<u8>,
    pub w_cert_vk: Vec<u8>,
    pub w_mbtr_vk: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sidechain {
    pub creation_block_hash: Hash256,
    pub creation_block_height: u32,
    pub creation_tx_hash: Hash256,
    pub last_top_quality_cert_hash: Hash256,
    pub last_top_quality_cert_referenced_epoch: i32,
    pub last_top_quality_cert_quality: i64,
    pub last_top_quality_cert_bwt_amount: i64,
    pub last_top_quality_cert_data_hash: Hash256,
    pub past_epoch_top_quality_cert_data_hash: Hash256,
    pub balance: i64,
    /// Amounts not yet spendable, keyed by the height they mature at.
    pub immature_amounts: BTreeMap<u32, i64>,
    pub creation_data: SidechainCreationData,
    pub current_state: SidechainState,
}

impl Default for Sidechain {
    fn default() -> Self {
        Self {
            creation_block_hash: [0u8; 32],
            creation_block_height: 0,
            creation_tx_hash: [0u8; 32],
            last_top_quality_cert_hash: [0u8; 32],
            last_top_quality_cert_referenced_epoch: Certificate::EPOCH_NULL,
            last_top_quality_cert_quality: Certificate::QUALITY_NULL,
            last_top_quality_cert_bwt_amount: 0,
            last_top_quality_cert_data_hash: [0u8; 32],
            past_epoch_top_quality_cert_data_hash: [0u8; 32],
            balance: 0,
            immature_amounts: BTreeMap::new(),
            creation_data: SidechainCreationData::default(),
            current_state: SidechainState::Unconfirmed,
        }
    }
}

impl Sidechain {
    /// Epoch the given mainchain height falls into, `EPOCH_NULL` before
    /// creation.
    pub fn epoch_for(&self, height: u32) -> i32 {
        if self.creation_data.withdrawal_epoch_length == 0 || height < self.creation_block_height {
            return Certificate::EPOCH_NULL;
        }
        ((height - self.creation_block_height) / self.creation_data.withdrawal_epoch_length) as i32
    }

    pub fn start_height_for_epoch(&self, epoch: i32) -> u32 {
        debug_assert!(epoch >= 0);
        self.creation_block_height + epoch as u32 * self.creation_data.withdrawal_epoch_length
    }

    /// Blocks past the end of an epoch within which its certificate must
    /// arrive.
    pub fn safeguard_margin(&self) -> u32 {
        self.creation_data.withdrawal_epoch_length / 2
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        let mut usage = self.immature_amounts.len()
            * (std::mem::size_of::<u32>() + std::mem::size_of::<i64>());
        usage += self.creation_data.custom_data.capacity();
        usage += self.creation_data.constant.capacity();
        usage += self.creation_data.w_cert_vk.capacity();
        if let Some(vk) = &self.creation_data.w_mbtr_vk {
            usage += vk.capacity();
        }
        usage
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.creation_block_hash);
        encoder.write_u32_le(self.creation_block_height);
        encoder.write_bytes(&self.creation_tx_hash);
        encoder.write_bytes(&self.last_top_quality_cert_hash);
        encoder.write_i32_le(self.last_top_quality_cert_referenced_epoch);
        encoder.write_i64_le(self.last_top_quality_cert_quality);
        encoder.write_i64_le(self.last_top_quality_cert_bwt_amount);
        encoder.write_bytes(&self.last_top_quality_cert_data_hash);
        encoder.write_bytes(&self.past_epoch_top_quality_cert_data_hash);
        encoder.write_i64_le(self.balance);
        encoder.write_compact_size(self.immature_amounts.len() as u64);
        for (height, amount) in &self.immature_amounts {
            encoder.write_u32_le(*height);
            encoder.write_i64_le(*amount);
        }
        encoder.write_u32_le(self.creation_data.withdrawal_epoch_length);
        encoder.write_var_bytes(&self.creation_data.custom_data);
        encoder.write_var_bytes(&self.creation_data.constant);
        encoder.write_var_bytes(&self.creation_data.w_cert_vk);
        match &self.creation_data.w_mbtr_vk {
            Some(vk) => {
                encoder.write_u8(1);
                encoder.write_var_bytes(vk);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u8(self.current_state.to_u8());
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let creation_block_hash = decoder.read_fixed::<32>()?;
        let creation_block_height = decoder.read_u32_le()?;
        let creation_tx_hash = decoder.read_fixed::<32>()?;
        let last_top_quality_cert_hash = decoder.read_fixed::<32>()?;
        let last_top_quality_cert_referenced_epoch = decoder.read_i32_le()?;
        let last_top_quality_cert_quality = decoder.read_i64_le()?;
        let last_top_quality_cert_bwt_amount = decoder.read_i64_le()?;
        let last_top_quality_cert_data_hash = decoder.read_fixed::<32>()?;
        let past_epoch_top_quality_cert_data_hash = decoder.read_fixed::<32>()?;
        let balance = decoder.read_i64_le()?;
        let count = decoder.read_compact_size()?;
        let mut immature_amounts = BTreeMap::new();
        for _ in 0..count {
            let height = decoder.read_u32_le()?;
            let amount = decoder.read_i64_le()?;
            immature_amounts.insert(height, amount);
        }
        let withdrawal_epoch_length = decoder.read_u32_le()?;
        let custom_data = decoder.read_var_bytes()?;
        let constant = decoder.read_var_bytes()?;
        let w_cert_vk = decoder.read_var_bytes()?;
        let w_mbtr_vk = if decoder.read_bool()? {
            Some(decoder.read_var_bytes()?)
        } else {
            None
        };
        let current_state = SidechainState::from_u8(decoder.read_u8()?)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            creation_block_hash,
            creation_block_height,
            creation_tx_hash,
            last_top_quality_cert_hash,
            last_top_quality_cert_referenced_epoch,
            last_top_quality_cert_quality,
            last_top_quality_cert_bwt_amount,
            last_top_quality_cert_data_hash,
            past_epoch_top_quality_cert_data_hash,
            balance,
            immature_amounts,
            creation_data: SidechainCreationData {
                withdrawal_epoch_length,
                custom_data,
                constant,
                w_cert_vk,
                w_mbtr_vk,
            },
            current_state,
        })
    }
}

/// Sidechain ids with something happening at one height: amounts maturing,
/// sidechains ceasing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SidechainEvents {
    pub maturing_scs: BTreeSet<Hash256>,
    pub ceasing_scs: BTreeSet<Hash256>,
}

impl SidechainEvents {
    pub fn is_null(&self) -> bool {
        self.maturing_scs.is_empty() && self.ceasing_scs.is_empty()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        (self.maturing_scs.len() + self.ceasing_scs.len()) * std::mem::size_of::<Hash256>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(self.maturing_scs.len() as u64);
        for sc_id in &self.maturing_scs {
            encoder.write_bytes(sc_id);
        }
        encoder.write_compact_size(self.ceasing_scs.len() as u64);
        for sc_id in &self.ceasing_scs {
            encoder.write_bytes(sc_id);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut events = Self::default();
        let maturing = decoder.read_compact_size()?;
        for _ in 0..maturing {
            events.maturing_scs.insert(decoder.read_fixed::<32>()?);
        }
        let ceasing = decoder.read_compact_size()?;
        for _ in 0..ceasing {
            events.ceasing_scs.insert(decoder.read_fixed::<32>()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(events)
    }
}

/// Whether a certificate's backward transfers are in force.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BwtState {
    On,
    Off,
}

/// Notification payload for wallet/mempool layers when ceasing or reorgs
/// toggle a certificate's backward transfers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertStatusUpdate {
    pub sc_id: Hash256,
    pub cert_hash: Hash256,
    pub referenced_epoch: i32,
    pub quality: i64,
    pub bwt_state: BwtState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sidechain() -> Sidechain {
        let mut sidechain = Sidechain {
            creation_block_hash: [0x11; 32],
            creation_block_height: 200,
            creation_tx_hash: [0x22; 32],
            balance: 1_000,
            current_state: SidechainState::Alive,
            ..Default::default()
        };
        sidechain.creation_data.withdrawal_epoch_length = 10;
        sidechain.creation_data.w_cert_vk = vec![0xde, 0xad];
        sidechain.immature_amounts.insert(204, 100);
        sidechain
    }

    #[test]
    fn epoch_math() {
        let sidechain = sample_sidechain();
        assert_eq!(sidechain.epoch_for(199), Certificate::EPOCH_NULL);
        assert_eq!(sidechain.epoch_for(200), 0);
        assert_eq!(sidechain.epoch_for(209), 0);
        assert_eq!(sidechain.epoch_for(210), 1);
        assert_eq!(sidechain.start_height_for_epoch(0), 200);
        assert_eq!(sidechain.start_height_for_epoch(1), 210);
        assert_eq!(sidechain.safeguard_margin(), 5);
    }

    #[test]
    fn sidechain_codec_roundtrip() {
        let mut sidechain = sample_sidechain();
        sidechain.creation_data.w_mbtr_vk = Some(vec![0x01, 0x02]);
        sidechain.immature_amounts.insert(300, 7);
        let decoded = Sidechain::decode(&sidechain.encode()).expect("decode");
        assert_eq!(decoded, sidechain);
    }

    #[test]
    fn events_codec_roundtrip() {
        let mut events = SidechainEvents::default();
        events.maturing_scs.insert([0x01; 32]);
        events.maturing_scs.insert([0x02; 32]);
        events.ceasing_scs.insert([0x03; 32]);
        let decoded = SidechainEvents::decode(&events.encode()).expect("decode");
        assert_eq!(decoded, events);
        assert!(!decoded.is_null());
        assert!(SidechainEvents::default().is_null());
    }
}
