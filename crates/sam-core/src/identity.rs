//! I2P identity handling
//!
//! SAM hands out identities as Base64 blobs: a serialised "keys and
//! certificate" structure for public destinations, or that structure plus
//! private key material for transient replies. Peers are addressed by the
//! SHA-256 of the serialised identity, rendered as a `.b32.i2p` name.

use crate::encoding::{base32_encode, i2p_base64_decode, i2p_base64_encode};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use tracing::warn;

/// I2P signature type for Ed25519 destinations
pub const SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519: u16 = 7;

/// Crypto public key section of a serialised identity
const CRYPTO_KEY_LEN: usize = 256;
/// Signing public key section
const SIGNING_KEY_SECTION_LEN: usize = 128;
/// Certificate header: type (1 byte) + payload length (2 bytes, big-endian)
const CERT_HEADER_LEN: usize = 3;
/// Minimum serialised identity: both key sections plus the certificate header
const MIN_IDENTITY_LEN: usize = CRYPTO_KEY_LEN + SIGNING_KEY_SECTION_LEN + CERT_HEADER_LEN;

/// Key certificate (carries signature/crypto type codes)
const CERT_TYPE_KEY: u8 = 5;

const ED25519_PUBLIC_LEN: usize = 32;
const ED25519_SEED_LEN: usize = 32;

/// Length of the serialised identity at the start of `blob`, or `None`
/// when the blob is too short to contain one.
fn identity_length(blob: &[u8]) -> Option<usize> {
    if blob.len() < MIN_IDENTITY_LEN {
        return None;
    }
    let cert_payload = u16::from_be_bytes([
        blob[MIN_IDENTITY_LEN - 2],
        blob[MIN_IDENTITY_LEN - 1],
    ]) as usize;
    let total = MIN_IDENTITY_LEN + cert_payload;
    (blob.len() >= total).then_some(total)
}

fn b32_address(identity: &[u8]) -> String {
    let hash = Sha256::digest(identity);
    format!("{}.b32.i2p", base32_encode(&hash))
}

/// Convert a SAM `DESTINATION=` / `FROM_DESTINATION=` field into a
/// `.b32.i2p` address.
///
/// With `is_transient` the field is a full private-key blob (identity
/// followed by key material); otherwise it is a bare public identity.
/// On parse failure the original string is returned with an `(Error: ...)`
/// or `(Warning: ...)` suffix so callers can detect it by substring.
pub fn b32_from_sam_destination(field: &str, is_transient: bool) -> String {
    if field.is_empty() {
        return "(Empty SAM Destination Field)".to_string();
    }

    let parsed = i2p_base64_decode(field)
        .ok()
        .and_then(|blob| identity_length(&blob).map(|len| b32_address(&blob[..len])));

    match parsed {
        Some(address) => address,
        None if is_transient => {
            warn!("failed to parse transient private key from SAM destination field");
            format!("{} (Error: transient key parse failed)", field)
        }
        None => {
            warn!("failed to parse SAM destination field to .b32.i2p");
            format!("{} (Warning: could not parse destination to .b32.i2p)", field)
        }
    }
}

/// Generate a fresh Ed25519 destination private-key blob, I2P Base64 encoded.
///
/// Layout matches the router's serialisation: 256-byte crypto key section,
/// 128-byte signing section with the Ed25519 public key right-justified
/// after random padding, a key certificate naming signature type 7, then
/// the private key material. The crypto slots hold random filler; nothing
/// on the SAM client path performs ElGamal.
pub fn generate_private_key() -> String {
    let mut rng = OsRng;

    let mut seed = [0u8; ED25519_SEED_LEN];
    rng.fill_bytes(&mut seed);
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();

    let mut crypto_public = [0u8; CRYPTO_KEY_LEN];
    rng.fill_bytes(&mut crypto_public);
    let mut signing_padding = [0u8; SIGNING_KEY_SECTION_LEN - ED25519_PUBLIC_LEN];
    rng.fill_bytes(&mut signing_padding);
    let mut crypto_private = [0u8; CRYPTO_KEY_LEN];
    rng.fill_bytes(&mut crypto_private);

    let mut blob = Vec::with_capacity(MIN_IDENTITY_LEN + 4 + CRYPTO_KEY_LEN + ED25519_SEED_LEN);
    blob.extend_from_slice(&crypto_public);
    blob.extend_from_slice(&signing_padding);
    blob.extend_from_slice(verifying_key.as_bytes());
    blob.push(CERT_TYPE_KEY);
    blob.extend_from_slice(&4u16.to_be_bytes());
    blob.extend_from_slice(&SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519.to_be_bytes());
    blob.extend_from_slice(&0u16.to_be_bytes());
    blob.extend_from_slice(&crypto_private);
    blob.extend_from_slice(&seed);

    i2p_base64_encode(&blob)
}

/// Six random lowercase letters, for SAM session nicknames.
pub fn generate_random_nickname() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| (b'a' + rng.gen_range(0..26)) as char)
        .collect()
}

/// Generate a private key together with its `.b32.i2p` address.
pub fn generate_key_and_identity() -> (String, String) {
    let private_key = generate_private_key();
    let address = b32_from_sam_destination(&private_key, true);
    (private_key, address)
}
