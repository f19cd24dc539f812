//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use them for every
//! credential that passes through the gateway: access tokens arriving in an
//! identify frame, rotation secrets, magic login codes, registration tokens,
//! and the access-token signing key.
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so a
//! struct deriving `Debug` that holds one of them is safe to log with `{:?}`
//! or through `tracing`. Secrets are zeroized when dropped.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct IdentifyPayload {
//!     token: SecretString,
//! }
//!
//! let payload = IdentifyPayload {
//!     token: SecretString::from("eyJhbGciOi..."),
//! };
//!
//! assert!(!format!("{payload:?}").contains("eyJ"));
//! assert!(payload.token.expose_secret().starts_with("eyJ"));
//! ```
//!
//! # Serde Integration
//!
//! With the `serde` feature enabled, secrets deserialize straight out of
//! client frames:
//!
//! ```rust
//! use serde::Deserialize;
//! use common::secret::SecretString;
//!
//! #[derive(Debug, Deserialize)]
//! struct RotateRequest {
//!     refresh_token: SecretString,
//! }
//!
//! let json = r#"{"refresh_token": "rt-secret"}"#;
//! let req: RotateRequest = serde_json::from_str(json).unwrap();
//! assert!(!format!("{req:?}").contains("rt-secret"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("123456");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("123456"));
    }

    #[test]
    fn test_frame_payload_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Identify {
            token: SecretString,
            client: String,
        }

        let json = r#"{"token": "access-abc", "client": "desktop"}"#;
        let identify: Identify = serde_json::from_str(json).expect("deserialize");

        assert_eq!(identify.token.expose_secret(), "access-abc");

        let debug = format!("{identify:?}");
        assert!(debug.contains("desktop"));
        assert!(!debug.contains("access-abc"));
    }

    #[test]
    fn test_secret_box_bytes() {
        let key = SecretBox::new(Box::new(vec![7u8; 32]));
        assert_eq!(key.expose_secret().len(), 32);
        assert!(!format!("{key:?}").contains('7'));
    }
}
