//! Simulcast layer naming and selection
//!
//! A presenter publishes up to three encodings of the screen track,
//! identified by RID. Subscribers are handed the layer matching their
//! estimated downlink; the mapping is a monotonic step function over the
//! target bitrate.

use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

pub const SIMULCAST_LEVEL_LOW: &str = "low";
pub const SIMULCAST_LEVEL_DEFAULT: &str = "default";
pub const SIMULCAST_LEVEL_HIGH: &str = "high";

/// Minimum estimated bitrate for the high layer.
pub const LEVEL_HIGH_RATE: i64 = 2_000_000;
/// Minimum estimated bitrate for the default layer.
pub const LEVEL_DEFAULT_RATE: i64 = 500_000;

/// Maps an estimated bitrate (bits per second) to the simulcast level a
/// subscriber should consume.
#[must_use]
pub fn level_for_rate(rate: i64) -> &'static str {
    if rate >= LEVEL_HIGH_RATE {
        SIMULCAST_LEVEL_HIGH
    } else if rate >= LEVEL_DEFAULT_RATE {
        SIMULCAST_LEVEL_DEFAULT
    } else {
        SIMULCAST_LEVEL_LOW
    }
}

/// Empty RID means the default level.
#[must_use]
pub fn normalize_rid(rid: &str) -> &str {
    if rid.is_empty() {
        SIMULCAST_LEVEL_DEFAULT
    } else {
        rid
    }
}

/// Builds the outbound screen track carrying one simulcast layer.
pub fn new_out_screen_track(
    codec: RTCRtpCodecCapability,
    rid: &str,
    stream_id: &str,
) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        codec,
        format!("screen-{rid}"),
        stream_id.to_string(),
    ))
}

/// Builds the outbound screen audio track.
pub fn new_out_screen_audio_track(
    codec: RTCRtpCodecCapability,
    stream_id: &str,
) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        codec,
        "screen-audio".to_string(),
        stream_id.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_bands() {
        assert_eq!(level_for_rate(0), SIMULCAST_LEVEL_LOW);
        assert_eq!(level_for_rate(499_999), SIMULCAST_LEVEL_LOW);
        assert_eq!(level_for_rate(500_000), SIMULCAST_LEVEL_DEFAULT);
        // A 640 kbit/s default layer sits squarely in the default band.
        assert_eq!(level_for_rate(640_000), SIMULCAST_LEVEL_DEFAULT);
        assert_eq!(level_for_rate(1_999_999), SIMULCAST_LEVEL_DEFAULT);
        assert_eq!(level_for_rate(2_000_000), SIMULCAST_LEVEL_HIGH);
        assert_eq!(level_for_rate(10_000_000), SIMULCAST_LEVEL_HIGH);
    }

    #[test]
    fn test_monotonic() {
        let order = |l: &str| match l {
            SIMULCAST_LEVEL_LOW => 0,
            SIMULCAST_LEVEL_DEFAULT => 1,
            _ => 2,
        };
        let mut prev = 0;
        for rate in (0..4_000_000).step_by(100_000) {
            let cur = order(level_for_rate(rate));
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[test]
    fn test_normalize_rid() {
        assert_eq!(normalize_rid(""), SIMULCAST_LEVEL_DEFAULT);
        assert_eq!(normalize_rid("high"), "high");
    }
}
