//! Metrics interface and Prometheus-backed implementation
//!
//! The server and sessions report through the `Metrics` trait so the
//! embedder decides where counters land; `PrometheusMetrics` is the
//! production implementation, `NullMetrics` keeps tests quiet.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, IntCounterVec,
    IntGaugeVec, Registry,
};

pub trait Metrics: Send + Sync {
    /// Counts an RTC error of the given kind (`ice`, `rtp`, `signaling`)
    /// for a group.
    fn inc_rtc_errors(&self, group_id: &str, kind: &str);

    /// Tracks negotiated RTP tracks by direction (`in`/`out`) and kind
    /// (`audio`/`video`).
    fn inc_rtp_tracks(&self, group_id: &str, direction: &str, kind: &str);
    fn dec_rtp_tracks(&self, group_id: &str, direction: &str, kind: &str);
}

pub struct PrometheusMetrics {
    registry: Registry,
    rtc_errors: IntCounterVec,
    rtp_tracks: IntGaugeVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let rtc_errors = register_int_counter_vec_with_registry!(
            "rtc_errors_total",
            "Total number of RTC errors",
            &["group", "type"],
            registry.clone()
        )?;

        let rtp_tracks = register_int_gauge_vec_with_registry!(
            "rtp_tracks",
            "Current number of negotiated RTP tracks",
            &["group", "direction", "type"],
            registry.clone()
        )?;

        Ok(Self {
            registry,
            rtc_errors,
            rtp_tracks,
        })
    }

    /// Registry to expose on the embedder's metrics endpoint.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Metrics for PrometheusMetrics {
    fn inc_rtc_errors(&self, group_id: &str, kind: &str) {
        self.rtc_errors.with_label_values(&[group_id, kind]).inc();
    }

    fn inc_rtp_tracks(&self, group_id: &str, direction: &str, kind: &str) {
        self.rtp_tracks
            .with_label_values(&[group_id, direction, kind])
            .inc();
    }

    fn dec_rtp_tracks(&self, group_id: &str, direction: &str, kind: &str) {
        self.rtp_tracks
            .with_label_values(&[group_id, direction, kind])
            .dec();
    }
}

/// No-op implementation.
pub struct NullMetrics;

impl Metrics for NullMetrics {
    fn inc_rtc_errors(&self, _group_id: &str, _kind: &str) {}
    fn inc_rtp_tracks(&self, _group_id: &str, _direction: &str, _kind: &str) {}
    fn dec_rtp_tracks(&self, _group_id: &str, _direction: &str, _kind: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_update() {
        let m = PrometheusMetrics::new().unwrap();
        m.inc_rtc_errors("g1", "ice");
        m.inc_rtp_tracks("g1", "out", "video");
        m.inc_rtp_tracks("g1", "out", "video");
        m.dec_rtp_tracks("g1", "out", "video");

        let families = m.registry().gather();
        let errors = families
            .iter()
            .find(|f| f.get_name() == "rtc_errors_total")
            .unwrap();
        assert_eq!(errors.get_metric()[0].get_counter().get_value() as i64, 1);

        let tracks = families
            .iter()
            .find(|f| f.get_name() == "rtp_tracks")
            .unwrap();
        assert_eq!(tracks.get_metric()[0].get_gauge().get_value() as i64, 1);
    }
}
