//! Cryptographic primitives for gateway credentials.
//!
//! - Access credentials are EdDSA (Ed25519) JWTs carrying [`AccessClaims`]
//! - Rotation secrets, login codes, and registration tokens are random values
//!   from `ring`'s CSPRNG; only their SHA-256 hex digest is ever stored

use crate::errors::{AuthError, GatewayError};
use base64::{engine::general_purpose, Engine as _};
use common::jwt::{self, AccessClaims, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::instrument;

/// Rejection-sampling bound for six-digit codes (largest multiple of 10^6 below 2^32).
const LOGIN_CODE_SAMPLE_BOUND: u32 = 4_294_000_000;

/// Signing and verification keys for access credentials.
#[derive(Clone)]
pub struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    key_id: String,
}

impl fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeys")
            .field("encoding", &"[REDACTED]")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SigningKeys {
    /// Build keys from a base64-encoded Ed25519 PKCS#8 document.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the value is not base64 or not a
    /// valid Ed25519 key.
    #[instrument(skip_all)]
    pub fn from_pkcs8_base64(encoded: &SecretString, key_id: &str) -> Result<Self, GatewayError> {
        let pkcs8 = general_purpose::STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|e| GatewayError::Config(format!("signing key is not base64: {e}")))?;

        let key_pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(&pkcs8)
            .map_err(|e| GatewayError::Config(format!("invalid Ed25519 signing key: {e}")))?;

        Ok(Self {
            encoding: EncodingKey::from_ed_der(&pkcs8),
            decoding: DecodingKey::from_ed_der(key_pair.public_key().as_ref()),
            key_id: key_id.to_string(),
        })
    }

    /// Key ID stamped into the `kid` header.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Generate a fresh Ed25519 key, base64 PKCS#8 encoded.
#[instrument(skip_all)]
pub fn generate_signing_key() -> Result<SecretString, GatewayError> {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|e| GatewayError::Internal(format!("Keypair generation failed: {e}")))?;
    Ok(SecretString::from(
        general_purpose::STANDARD.encode(pkcs8.as_ref()),
    ))
}

/// Sign an access credential.
#[instrument(skip_all)]
pub fn sign_access_token(claims: &AccessClaims, keys: &SigningKeys) -> Result<String, GatewayError> {
    let mut header = Header::new(Algorithm::EdDSA);
    header.typ = Some("JWT".to_string());
    header.kid = Some(keys.key_id.clone());

    encode(&header, claims, &keys.encoding)
        .map_err(|e| GatewayError::Internal(format!("JWT signing operation failed: {e}")))
}

/// Verify an access credential's signature, expiry, and issue time.
///
/// Session-version checks are the caller's job; this only proves the token
/// was minted by us and is still within its lifetime.
///
/// # Errors
///
/// - `AuthError::Expired` - signature valid but `exp` has passed
/// - `AuthError::Failed` - anything else (size, kid, signature, format, `iat`)
#[instrument(skip_all)]
pub fn verify_access_token(token: &str, keys: &SigningKeys) -> Result<AccessClaims, AuthError> {
    let kid = jwt::extract_kid(token).map_err(|_| AuthError::Failed)?;
    if kid != keys.key_id {
        tracing::debug!(target: "gw.auth", "Token rejected: unknown key id");
        return Err(AuthError::Failed);
    }

    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.validate_exp = true;
    validation.leeway = 0;

    let data = decode::<AccessClaims>(token, &keys.decoding, &validation).map_err(|e| {
        tracing::debug!(target: "gw.auth", error = %e, "Token verification failed");
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Failed,
        }
    })?;

    jwt::validate_iat(data.claims.iat, DEFAULT_CLOCK_SKEW).map_err(|_| AuthError::Failed)?;

    Ok(data.claims)
}

/// SHA-256 hex digest of a secret, as stored by the repository.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes(len: usize) -> Result<Vec<u8>, GatewayError> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes)
        .map_err(|e| GatewayError::Internal(format!("Random bytes generation failed: {e}")))?;
    Ok(bytes)
}

/// Generate an opaque secret (32 bytes, URL-safe base64).
///
/// Used for rotation credentials and registration tokens.
#[instrument(skip_all)]
pub fn generate_opaque_secret() -> Result<SecretString, GatewayError> {
    let bytes = generate_random_bytes(32)?;
    Ok(SecretString::from(
        general_purpose::URL_SAFE_NO_PAD.encode(bytes),
    ))
}

/// Generate a uniformly distributed six-digit login code.
#[instrument(skip_all)]
pub fn generate_login_code() -> Result<SecretString, GatewayError> {
    let rng = SystemRandom::new();
    loop {
        let mut buf = [0u8; 4];
        rng.fill(&mut buf)
            .map_err(|e| GatewayError::Internal(format!("Random code generation failed: {e}")))?;
        let value = u32::from_be_bytes(buf);
        if value < LOGIN_CODE_SAMPLE_BOUND {
            return Ok(SecretString::from(format!("{:06}", value % 1_000_000)));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn keys() -> SigningKeys {
        SigningKeys::from_pkcs8_base64(&generate_signing_key().unwrap(), "test-kid").unwrap()
    }

    fn claims(exp_offset: i64) -> AccessClaims {
        let now = chrono::Utc::now().timestamp();
        AccessClaims {
            sub: uuid::Uuid::new_v4().to_string(),
            ver: 1,
            iat: now,
            exp: now + exp_offset,
            jti: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let keys = keys();
        let claims = claims(300);
        let token = sign_access_token(&claims, &keys).unwrap();

        let verified = verify_access_token(&token, &keys).unwrap();
        assert_eq!(verified, claims);
    }

    #[test]
    fn test_expired_token_is_distinguished() {
        let keys = keys();
        let token = sign_access_token(&claims(-10), &keys).unwrap();
        assert_eq!(verify_access_token(&token, &keys), Err(AuthError::Expired));
    }

    #[test]
    fn test_foreign_key_rejected() {
        let ours = keys();
        let theirs = keys();
        let token = sign_access_token(&claims(300), &theirs).unwrap();
        assert_eq!(verify_access_token(&token, &ours), Err(AuthError::Failed));
    }

    #[test]
    fn test_wrong_kid_rejected() {
        let signing = generate_signing_key().unwrap();
        let a = SigningKeys::from_pkcs8_base64(&signing, "kid-a").unwrap();
        let b = SigningKeys::from_pkcs8_base64(&signing, "kid-b").unwrap();
        let token = sign_access_token(&claims(300), &a).unwrap();
        assert_eq!(verify_access_token(&token, &b), Err(AuthError::Failed));
    }

    #[test]
    fn test_tampered_and_garbage_tokens_rejected() {
        let keys = keys();
        let token = sign_access_token(&claims(300), &keys).unwrap();
        let other = sign_access_token(&claims(600), &keys).unwrap();

        // Payload from one token, signature from another
        let (signed_part, _) = token.rsplit_once('.').unwrap();
        let (_, other_sig) = other.rsplit_once('.').unwrap();
        let tampered = format!("{signed_part}.{other_sig}");

        assert_eq!(verify_access_token(&tampered, &keys), Err(AuthError::Failed));
        assert_eq!(verify_access_token("", &keys), Err(AuthError::Failed));
        assert_eq!(
            verify_access_token(&"x".repeat(10_000), &keys),
            Err(AuthError::Failed)
        );
    }

    #[test]
    fn test_invalid_signing_key_is_config_error() {
        let result = SigningKeys::from_pkcs8_base64(&SecretString::from("bm90LWEta2V5"), "k");
        assert!(matches!(result, Err(GatewayError::Config(_))));
        let result = SigningKeys::from_pkcs8_base64(&SecretString::from("%%%"), "k");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_hash_secret_is_stable_hex() {
        let a = hash_secret("secret");
        assert_eq!(a, hash_secret("secret"));
        assert_ne!(a, hash_secret("secret2"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_login_code_shape() {
        for _ in 0..50 {
            let code = generate_login_code().unwrap();
            let code = code.expose_secret();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_opaque_secrets_unique() {
        let a = generate_opaque_secret().unwrap();
        let b = generate_opaque_secret().unwrap();
        assert_ne!(a.expose_secret(), b.expose_secret());
        assert_eq!(a.expose_secret().len(), 43);
    }

    #[test]
    fn test_signing_keys_debug_redacted() {
        let debug = format!("{:?}", keys());
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("test-kid"));
    }
}
