//! Credential issuance and validation.
//!
//! - [`crypto`] - Ed25519 access credentials and hashed single-use secrets
//! - [`validator`] - Session Validator (signature, expiry, session version)
//! - [`tokens`] - Token Lifecycle Manager (issue, rotate, invalidate, revoke)
//! - [`login`] - Magic-code login and registration tokens

pub mod crypto;
pub mod login;
pub mod tokens;
pub mod validator;

pub use crypto::SigningKeys;
pub use login::LoginService;
pub use tokens::{SessionTokens, TokenService};
pub use validator::{Identity, SessionValidator, ValidatedCredential};
