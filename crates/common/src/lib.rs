//! Common utilities and types shared across gateway components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, iat validation, access claims)
pub mod jwt;
