//! Media frame protocol for the gateway SFU.
//!
//! Voice audio and screen-share video travel from a publishing client to the
//! selective forwarding unit as binary frames with a fixed header. The SFU
//! never inspects the payload; it only reads the header to decide where the
//! frame goes and re-stamps the publisher before forwarding.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod frame;
