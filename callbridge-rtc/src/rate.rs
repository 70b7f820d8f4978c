//! Sliding-window bitrate estimation
//!
//! A `RateMonitor` keeps a ring buffer of packet sizes with their arrival
//! times and reports the observed bitrate over a configured window. One
//! monitor exists per remote simulcast layer while a screen share is active.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Injectable clock so tests can drive the window deterministically.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

pub struct RateMonitor {
    inner: RwLock<MonitorInner>,
    sampling_size: Duration,
    now: Clock,
}

struct MonitorInner {
    samples: Vec<usize>,
    timestamps: Vec<Instant>,
    samples_ptr: usize,
    filled: bool,
}

impl RateMonitor {
    /// `sampling_size` is the window duration the rate is measured over.
    pub fn new(sampling_size: Duration, now: Option<Clock>) -> Result<Self> {
        if sampling_size.is_zero() {
            return Err(Error::Config("invalid sampling size".to_string()));
        }

        Ok(Self {
            inner: RwLock::new(MonitorInner {
                samples: Vec::new(),
                timestamps: Vec::new(),
                samples_ptr: 0,
                filled: false,
            }),
            sampling_size,
            now: now.unwrap_or_else(|| Arc::new(Instant::now)),
        })
    }

    pub fn push_sample(&self, size: usize) {
        let mut inner = self.inner.write();
        let ts = (self.now)();

        // The buffer keeps growing until it covers double the sampling
        // window; a burst of packets at startup would otherwise leave too
        // few samples to cover the desired duration.
        if !inner.filled && inner.samples_duration() < self.sampling_size * 2 {
            inner.samples.push(size);
            inner.timestamps.push(ts);
            inner.samples_ptr += 1;
            if inner.samples_duration() >= self.sampling_size * 2 {
                inner.filled = true;
            }
            return;
        }

        let len = inner.samples.len();
        let idx = inner.samples_ptr % len;
        inner.samples[idx] = size;
        inner.timestamps[idx] = ts;
        inner.samples_ptr += 1;
    }

    /// Wall-clock span currently covered by the stored samples.
    pub fn samples_duration(&self) -> Duration {
        self.inner.read().samples_duration()
    }

    /// Returns the observed rate in bits per second and the span it covers.
    /// Until the monitor is filled the result is `(-1, 0)`.
    pub fn rate(&self) -> (i64, Duration) {
        let inner = self.inner.read();

        if !inner.filled {
            return (-1, Duration::ZERO);
        }

        let now = (self.now)();
        let len = inner.samples.len();

        let mut total_bytes = 0usize;
        let mut span = Duration::ZERO;
        // Walk backward from the newest sample until the accumulated span
        // covers the sampling window or the buffer is exhausted.
        for off in 1..=len {
            let i = (inner.samples_ptr - off) % len;
            span = now.saturating_duration_since(inner.timestamps[i]);
            total_bytes += inner.samples[i];

            if span >= self.sampling_size {
                break;
            }
        }

        if span.is_zero() {
            return (-1, Duration::ZERO);
        }

        let bits_per_sec = (total_bytes as f64 / span.as_secs_f64() * 8.0).round();

        (bits_per_sec as i64, span)
    }
}

impl MonitorInner {
    fn samples_duration(&self) -> Duration {
        if self.timestamps.is_empty() {
            return Duration::ZERO;
        }

        let len = self.timestamps.len();
        let last = self.timestamps[(self.samples_ptr - 1) % len];
        let first = self.timestamps[self.samples_ptr % len];

        last.saturating_duration_since(first)
    }
}
