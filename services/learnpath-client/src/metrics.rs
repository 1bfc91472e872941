//! Prometheus metrics recorder
//!
//! The libraries emit through the `metrics` facade:
//!
//! - `access_refresh_total` (counter): label `outcome`
//! - `access_refresh_waiters` (histogram): callers served by one refresh
//! - `access_channel_reconnects_total` (counter): label `channel`
//! - `access_correlation_total` (counter): labels `method`, `outcome`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const WAITER_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("access_refresh_waiters".to_string()),
        WAITER_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `access_refresh_waiters` renders as a histogram with `_bucket` lines rather
/// than the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    /// Isolated recorder/handle pair; only one global recorder may exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn refresh_waiters_render_as_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::histogram!("access_refresh_waiters").record(5.0);

        let output = handle.render();
        assert!(output.contains("access_refresh_waiters_bucket"), "got: {output}");
        assert!(output.contains("le=\"1\""));
        assert!(output.contains("le=\"100\""));
        assert!(output.contains("le=\"+Inf\""));
    }

    #[test]
    fn correlation_counter_carries_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::counter!(
            "access_correlation_total",
            "method" => "RequestLessonContent",
            "outcome" => "timeout"
        )
        .increment(1);

        let output = handle.render();
        assert!(output.contains("access_correlation_total"));
        assert!(output.contains("method=\"RequestLessonContent\""));
        assert!(output.contains("outcome=\"timeout\""));
    }
}
