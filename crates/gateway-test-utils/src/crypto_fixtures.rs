//! Deterministic cryptographic fixtures for testing
//!
//! Same seed, same key: tests that compare credentials across gateway
//! instances stay reproducible.

use base64::engine::general_purpose;
use base64::Engine;
use common::secret::SecretString;
use ring::signature::Ed25519KeyPair;
use thiserror::Error;

/// Test fixture error type
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

/// Generate a deterministic Ed25519 signing key, base64 PKCS#8 encoded.
///
/// The result is accepted by `Config::signing_key`.
pub fn test_signing_key(seed: u8) -> Result<SecretString, FixtureError> {
    let mut seed_bytes = [0u8; 32];
    seed_bytes[0] = seed;
    for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
        *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
    }

    // Reject seeds ring cannot use before handing them to the gateway
    Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
        .map_err(|e| FixtureError::Crypto(format!("Failed to generate test keypair: {:?}", e)))?;

    let pkcs8 = build_pkcs8_from_seed(&seed_bytes);
    Ok(SecretString::from(general_purpose::STANDARD.encode(pkcs8)))
}

/// Build a PKCS#8 v1 document from an Ed25519 seed (RFC 8410).
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    let mut pkcs8 = Vec::with_capacity(48);

    // SEQUENCE, 46 bytes
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    // Version: INTEGER 0
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    // AlgorithmIdentifier: SEQUENCE { OID 1.3.101.112 }
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    // privateKey: OCTET STRING { OCTET STRING seed }
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);

    pkcs8
}
