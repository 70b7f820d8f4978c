//! Bandwidth estimation interface
//!
//! The congestion controller lives in the transport layer; sessions only
//! consume its current target bitrate to pick a simulcast level.

use std::sync::atomic::{AtomicI64, Ordering};

pub trait BandwidthEstimator: Send + Sync {
    /// Current target outbound bitrate for the peer, in bits per second.
    fn target_bitrate(&self) -> i64;
}

/// Estimator holding an externally updated target. The embedder feeds it
/// from whatever congestion controller the transport exposes.
pub struct FixedRateEstimator {
    target: AtomicI64,
}

impl FixedRateEstimator {
    pub fn new(target: i64) -> Self {
        Self {
            target: AtomicI64::new(target),
        }
    }

    pub fn set_target_bitrate(&self, target: i64) {
        self.target.store(target, Ordering::Relaxed);
    }
}

impl Default for FixedRateEstimator {
    fn default() -> Self {
        // Comfortable default band for a screen share.
        Self::new(1_500_000)
    }
}

impl BandwidthEstimator for FixedRateEstimator {
    fn target_bitrate(&self) -> i64 {
        self.target.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulcast::{level_for_rate, SIMULCAST_LEVEL_DEFAULT, SIMULCAST_LEVEL_HIGH};

    #[test]
    fn test_default_target_maps_to_default_level() {
        let bwe = FixedRateEstimator::default();
        assert_eq!(level_for_rate(bwe.target_bitrate()), SIMULCAST_LEVEL_DEFAULT);
    }

    #[test]
    fn test_set_target() {
        let bwe = FixedRateEstimator::new(100_000);
        bwe.set_target_bitrate(3_000_000);
        assert_eq!(bwe.target_bitrate(), 3_000_000);
        assert_eq!(level_for_rate(bwe.target_bitrate()), SIMULCAST_LEVEL_HIGH);
    }
}
