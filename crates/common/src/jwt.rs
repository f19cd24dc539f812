//! JWT utilities shared by the gateway's credential issuer and validator.
//!
//! This module provides:
//! - Size limits for DoS prevention
//! - Clock skew constants and `iat` validation
//! - Key ID extraction from JWT headers
//! - The access-token claims structure
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only EdDSA (Ed25519) algorithm is accepted by the gateway
//! - Generic error messages prevent information leakage
//! - `sub` and `jti` in [`AccessClaims`] are redacted in Debug output

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Access tokens arrive in client identify frames, so the gateway rejects
/// anything larger before base64 decoding or signature verification.
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Default JWT clock skew tolerance (5 minutes per NIST SP 800-63B).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during structural JWT validation.
///
/// Messages are intentionally generic. Detail is logged at debug level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token is missing required `kid` header.
    #[error("The access token is invalid or expired")]
    MissingKid,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

// =============================================================================
// Claims Types
// =============================================================================

/// Access credential claims.
///
/// The credential is stateless: validity is re-derived on every use from the
/// signature, `exp`, and a comparison of `ver` against the user's live session
/// version. Bumping the stored version invalidates every token carrying an
/// older `ver` without enumerating them.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    /// Subject (user UUID) - redacted in Debug output.
    pub sub: String,

    /// Session version captured at issuance.
    pub ver: u64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Unique token identifier - redacted in Debug output.
    pub jti: String,
}

impl fmt::Debug for AccessClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessClaims")
            .field("sub", &"[REDACTED]")
            .field("ver", &self.ver)
            .field("iat", &self.iat)
            .field("exp", &self.exp)
            .field("jti", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Reject tokens over [`MAX_JWT_SIZE_BYTES`] before any parsing.
///
/// # Errors
///
/// Returns `TokenTooLarge` when the token exceeds the limit.
pub fn check_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }
    Ok(())
}

/// Extract the `kid` (key ID) from a JWT header without verifying the signature.
///
/// The token MUST still be verified after the key is selected.
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds size limit
/// - `MalformedToken` - Wrong structure, bad base64, or invalid JSON
/// - `MissingKid` - Header has no non-empty string `kid`
pub fn extract_kid(token: &str) -> Result<String, JwtValidationError> {
    check_size(token)?;

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        tracing::debug!(
            target: "common.jwt",
            parts = parts.len(),
            "Token rejected: invalid JWT format"
        );
        return Err(JwtValidationError::MalformedToken);
    }

    let header_part = parts.first().ok_or(JwtValidationError::MalformedToken)?;
    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT header base64");
        JwtValidationError::MalformedToken
    })?;

    let header: serde_json::Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT header JSON");
        JwtValidationError::MalformedToken
    })?;

    header
        .get("kid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingKid)
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` if `iat` is more than `clock_skew` ahead of now.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // Safe cast: clock_skew is bounded to MAX_CLOCK_SKEW (600 seconds)
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.min(MAX_CLOCK_SKEW).as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn token_with_header(header: &str) -> String {
        format!("{}.payload.signature", URL_SAFE_NO_PAD.encode(header))
    }

    #[test]
    fn test_check_size_boundary() {
        assert!(check_size(&"a".repeat(MAX_JWT_SIZE_BYTES)).is_ok());
        assert_eq!(
            check_size(&"a".repeat(MAX_JWT_SIZE_BYTES + 1)),
            Err(JwtValidationError::TokenTooLarge)
        );
    }

    #[test]
    fn test_extract_kid_valid_token() {
        let token = token_with_header(r#"{"alg":"EdDSA","typ":"JWT","kid":"gw-key-01"}"#);
        assert_eq!(extract_kid(&token).unwrap(), "gw-key-01");
    }

    #[test]
    fn test_extract_kid_missing_or_empty_kid() {
        let token = token_with_header(r#"{"alg":"EdDSA","typ":"JWT"}"#);
        assert_eq!(extract_kid(&token), Err(JwtValidationError::MissingKid));

        let token = token_with_header(r#"{"alg":"EdDSA","kid":""}"#);
        assert_eq!(extract_kid(&token), Err(JwtValidationError::MissingKid));

        let token = token_with_header(r#"{"alg":"EdDSA","kid":12345}"#);
        assert_eq!(extract_kid(&token), Err(JwtValidationError::MissingKid));
    }

    #[test]
    fn test_extract_kid_malformed() {
        assert_eq!(
            extract_kid("not-a-jwt"),
            Err(JwtValidationError::MalformedToken)
        );
        assert_eq!(
            extract_kid("!!!.payload.signature"),
            Err(JwtValidationError::MalformedToken)
        );
        let not_json = format!("{}.p.s", URL_SAFE_NO_PAD.encode("not-json"));
        assert_eq!(
            extract_kid(&not_json),
            Err(JwtValidationError::MalformedToken)
        );
    }

    #[test]
    fn test_extract_kid_oversized_token() {
        let oversized = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert_eq!(
            extract_kid(&oversized),
            Err(JwtValidationError::TokenTooLarge)
        );
    }

    #[test]
    fn test_validate_iat_boundaries() {
        let now = 1_700_000_000;
        let skew = Duration::from_secs(300);

        assert!(validate_iat_at(now - 3600, skew, now).is_ok());
        assert!(validate_iat_at(now + 300, skew, now).is_ok());
        assert_eq!(
            validate_iat_at(now + 301, skew, now),
            Err(JwtValidationError::IatTooFarInFuture)
        );
    }

    #[test]
    fn test_validate_iat_caps_configured_skew() {
        let now = 1_700_000_000;
        // A misconfigured hour of skew is clamped to MAX_CLOCK_SKEW
        assert!(validate_iat_at(now + 1800, Duration::from_secs(3600), now).is_err());
        assert!(validate_iat(chrono::Utc::now().timestamp(), DEFAULT_CLOCK_SKEW).is_ok());
    }

    #[test]
    fn test_access_claims_debug_redacts_identity() {
        let claims = AccessClaims {
            sub: "0b5e2f9a-user".to_string(),
            ver: 3,
            iat: 1,
            exp: 2,
            jti: "token-id-123".to_string(),
        };

        let debug = format!("{claims:?}");
        assert!(!debug.contains("0b5e2f9a-user"));
        assert!(!debug.contains("token-id-123"));
        assert!(debug.contains("ver: 3"));
    }
}
