//! I2P text encodings
//!
//! I2P swaps `+/` in the Base64 alphabet for `-~`, and `.b32.i2p` addresses
//! use lowercase RFC 4648 Base32 without padding.

use crate::{Result, SamError};

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~";

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Encode bytes as I2P Base64 (padded, as the routers emit it).
pub fn i2p_base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let mut triple = (chunk[0] as u32) << 16;
        if let Some(&b) = chunk.get(1) {
            triple |= (b as u32) << 8;
        }
        if let Some(&b) = chunk.get(2) {
            triple |= b as u32;
        }

        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[triple as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}

/// Decode an I2P Base64 string. Accepts both padded and unpadded input.
pub fn i2p_base64_decode(input: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;

    for &b in input.as_bytes() {
        if b == b'=' {
            break;
        }
        let value = match BASE64_ALPHABET.iter().position(|&a| a == b) {
            Some(v) => v as u32,
            None => {
                return Err(SamError::InvalidDestination(format!(
                    "invalid I2P base64 character: {:?}",
                    b as char
                )))
            }
        };
        acc = (acc << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }

    // A single leftover 6-bit group cannot encode a byte.
    if bits >= 6 {
        return Err(SamError::InvalidDestination(format!(
            "truncated I2P base64 input of length {}",
            input.len()
        )));
    }

    Ok(out)
}

/// Encode bytes as lowercase Base32 without padding.
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut acc: u64 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        acc = (acc << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[(acc >> bits) as usize & 0x1f] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[(acc << (5 - bits)) as usize & 0x1f] as char);
    }
    out
}
