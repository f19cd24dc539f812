//! Metric definitions for the gateway.
//!
//! - `gw_` prefix
//! - `_total` suffix for counters
//!
//! Label values are bounded by code (`result`, `queue`, `outcome`, `kind`).

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the handle used to render `/metrics`.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `gw_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_connections_active").set(count as f64);
}

/// Metric: `gw_identify_total`
/// Labels: `result` (success, auth_failed, timeout, protocol_error)
pub fn record_identify(result: &'static str) {
    counter!("gw_identify_total", "result" => result).increment(1);
}

/// Metric: `gw_takeovers_total`
pub fn record_takeover() {
    counter!("gw_takeovers_total").increment(1);
}

/// Metric: `gw_frames_dropped_total`
/// Labels: `queue` (control, media)
pub fn record_frame_dropped(queue: &'static str) {
    counter!("gw_frames_dropped_total", "queue" => queue).increment(1);
}

/// Metric: `gw_voice_members`
pub fn set_voice_members(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_voice_members").set(count as f64);
}

/// Metric: `gw_negotiations_total`
/// Labels: `outcome` (established, failed, timed_out, aborted)
pub fn record_negotiation(outcome: &'static str) {
    counter!("gw_negotiations_total", "outcome" => outcome).increment(1);
}

/// Metric: `gw_media_frames_forwarded_total`
/// Labels: `kind` (audio, screen)
pub fn record_media_forwarded(kind: &'static str, recipients: usize) {
    counter!("gw_media_frames_forwarded_total", "kind" => kind)
        .increment(u64::try_from(recipients).unwrap_or(u64::MAX));
}

/// Metric: `gw_media_subscribers_detached_total`
pub fn record_subscriber_detached() {
    counter!("gw_media_subscribers_detached_total").increment(1);
}

/// Metric: `gw_token_rotations_total`
/// Labels: `result` (success, rejected)
pub fn record_token_rotation(result: &'static str) {
    counter!("gw_token_rotations_total", "result" => result).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_connections_active(3);
        record_identify("success");
        record_frame_dropped("control");
        record_media_forwarded("audio", 0);
    }

    #[test]
    fn test_metrics_are_recorded_with_expected_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_connections_active(2);
            record_identify("success");
            record_identify("auth_failed");
            record_takeover();
            record_frame_dropped("control");
            set_voice_members(1);
            record_negotiation("timed_out");
            record_media_forwarded("audio", 3);
            record_subscriber_detached();
            record_token_rotation("success");
        });

        let metrics = snapshotter.snapshot().into_vec();
        let names: Vec<String> = metrics
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();
        for expected in [
            "gw_connections_active",
            "gw_identify_total",
            "gw_takeovers_total",
            "gw_frames_dropped_total",
            "gw_voice_members",
            "gw_negotiations_total",
            "gw_media_frames_forwarded_total",
            "gw_media_subscribers_detached_total",
            "gw_token_rotations_total",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }

        let forwarded = metrics
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "gw_media_frames_forwarded_total")
            .map(|(_, _, _, value)| value.clone())
            .unwrap();
        assert_eq!(*forwarded, DebugValue::Counter(3));
    }
}
