//! Amount and script compression for the compact coin format.
//!
//! Amounts use the exponent/digit packing scheme from the classic txout
//! compressor. Scripts recognize the common standard forms and replace them
//! with a short tag; anything else is stored raw with its length offset by
//! the number of reserved tags.

use crate::encoding::{DecodeError, Decoder, Encoder};

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;

/// Number of script tags reserved for special forms.
const SPECIAL_SCRIPTS: u64 = 6;

pub fn compress_amount(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut e = 0u64;
    let mut n = n;
    while n % 10 == 0 && e < 9 {
        n /= 10;
        e += 1;
    }
    if e < 9 {
        let d = n % 10;
        n /= 10;
        1 + (n * 9 + d - 1) * 10 + e
    } else {
        1 + (n - 1) * 10 + 9
    }
}

pub fn decompress_amount(x: u64) -> u64 {
    if x == 0 {
        return 0;
    }
    let mut x = x - 1;
    let e = x % 10;
    x /= 10;
    let mut n = if e < 9 {
        let d = (x % 9) + 1;
        x /= 9;
        x * 10 + d
    } else {
        x + 1
    };
    for _ in 0..e {
        n *= 10;
    }
    n
}

fn to_key_id(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        Some(&script[3..23])
    } else {
        None
    }
}

fn to_script_id(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        Some(&script[2..22])
    } else {
        None
    }
}

fn to_compressed_pubkey(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 35
        && script[0] == 33
        && script[34] == OP_CHECKSIG
        && (script[1] == 0x02 || script[1] == 0x03)
    {
        Some(&script[1..34])
    } else {
        None
    }
}

/// Append the compressed form of `script` to `encoder`.
pub fn write_compressed_script(encoder: &mut Encoder, script: &[u8]) {
    if let Some(hash) = to_key_id(script) {
        encoder.write_u8(0x00);
        encoder.write_bytes(hash);
        return;
    }
    if let Some(hash) = to_script_id(script) {
        encoder.write_u8(0x01);
        encoder.write_bytes(hash);
        return;
    }
    if let Some(pubkey) = to_compressed_pubkey(script) {
        // The tag doubles as the pubkey's parity byte (0x02 / 0x03).
        encoder.write_bytes(pubkey);
        return;
    }
    encoder.write_varint(script.len() as u64 + SPECIAL_SCRIPTS);
    encoder.write_bytes(script);
}

/// Inverse of [`write_compressed_script`].
pub fn read_compressed_script(decoder: &mut Decoder<'_>) -> Result<Vec<u8>, DecodeError> {
    let tag = decoder.read_varint()?;
    match tag {
        0x00 => {
            let hash = decoder.read_bytes(20)?;
            let mut script = Vec::with_capacity(25);
            script.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
            script.extend_from_slice(hash);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            Ok(script)
        }
        0x01 => {
            let hash = decoder.read_bytes(20)?;
            let mut script = Vec::with_capacity(23);
            script.extend_from_slice(&[OP_HASH160, 20]);
            script.extend_from_slice(hash);
            script.push(OP_EQUAL);
            Ok(script)
        }
        0x02 | 0x03 => {
            let body = decoder.read_bytes(32)?;
            let mut script = Vec::with_capacity(35);
            script.push(33);
            script.push(tag as u8);
            script.extend_from_slice(body);
            script.push(OP_CHECKSIG);
            Ok(script)
        }
        0x04 | 0x05 => Err(DecodeError::Unsupported("uncompressed pubkey script")),
        raw => Ok(decoder.read_bytes((raw - SPECIAL_SCRIPTS) as usize)?.to_vec()),
    }
}
