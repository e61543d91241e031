//! Deterministic credential derivation and reality key helpers.
//!
//! Everything here is a pure function of its inputs: re-deriving with the
//! same seed yields byte-identical output.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Derive a stable UUID from a user seed.
pub fn derive_uuid(seed: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}

/// Derive a stable password from a user seed.
pub fn derive_password(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Derive the X25519 public key for a reality private key.
///
/// The key is expected in sing-box's encoding: unpadded url-safe base64 of
/// the raw 32-byte scalar. The result uses the same encoding.
pub fn reality_public_key(private_key: &str) -> Result<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(private_key.trim())
        .map_err(|e| Error::Config(format!("invalid reality private key: {}", e)))?;
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| Error::Config("reality private key must be 32 bytes".to_string()))?;
    let secret = StaticSecret::from(raw);
    let public = PublicKey::from(&secret);
    Ok(URL_SAFE_NO_PAD.encode(public.as_bytes()))
}
