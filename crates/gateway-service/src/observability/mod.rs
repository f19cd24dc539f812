//! Observability for the gateway.
//!
//! Instrumentation uses `#[instrument(skip_all)]` and only records ids and
//! bounded enums. Credentials, message content, and SDP never reach logs or
//! metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `gw_connections_active` | Gauge | none | Open gateway connections |
//! | `gw_identify_total` | Counter | `result` | Identify outcomes |
//! | `gw_takeovers_total` | Counter | none | Connections displaced by a newer one |
//! | `gw_frames_dropped_total` | Counter | `queue` | Outbound frames dropped on a full queue |
//! | `gw_voice_members` | Gauge | none | Users currently in voice |
//! | `gw_negotiations_total` | Counter | `outcome` | Finished negotiations |
//! | `gw_media_frames_forwarded_total` | Counter | `kind` | Media frames delivered to recipients |
//! | `gw_media_subscribers_detached_total` | Counter | none | Stalled media subscribers removed |
//! | `gw_token_rotations_total` | Counter | `result` | Rotation credential exchanges |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Readiness};
