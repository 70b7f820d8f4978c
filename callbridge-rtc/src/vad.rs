//! Voice activity detection
//!
//! The monitor consumes audio-level values carried in the
//! `ssrc-audio-level` RTP header extension (dBov, 0 loudest to 127
//! silence) and fires its callback on voice state transitions only.

use crate::error::{Error, Result};
use crate::rate::Clock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Levels below this dBov value count as voice activity.
    pub voice_level_threshold: u8,
    /// Window over which activations are counted.
    pub activation_window: Duration,
    /// Number of active samples inside the window that declare voice.
    pub min_active_samples: usize,
    /// Silence duration after which voice is declared off.
    pub silence_after: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            voice_level_threshold: 50,
            activation_window: Duration::from_millis(400),
            min_active_samples: 8,
            silence_after: Duration::from_millis(1500),
        }
    }
}

impl VadConfig {
    fn is_valid(&self) -> Result<()> {
        if self.voice_level_threshold > 127 {
            return Err(Error::Config(
                "invalid voice level threshold: out of dBov range".to_string(),
            ));
        }
        if self.activation_window.is_zero() || self.silence_after.is_zero() {
            return Err(Error::Config("invalid VAD window duration".to_string()));
        }
        if self.min_active_samples == 0 {
            return Err(Error::Config("invalid VAD sample count".to_string()));
        }
        Ok(())
    }
}

pub struct VadMonitor {
    cfg: VadConfig,
    on_state_change: Box<dyn Fn(bool) + Send + Sync>,
    state: Mutex<VadState>,
    now: Clock,
}

#[derive(Default)]
struct VadState {
    voice: bool,
    active_count: usize,
    window_start: Option<Instant>,
    last_active: Option<Instant>,
}

impl VadMonitor {
    pub fn new(
        cfg: VadConfig,
        on_state_change: impl Fn(bool) + Send + Sync + 'static,
        now: Option<Clock>,
    ) -> Result<Self> {
        cfg.is_valid()?;
        Ok(Self {
            cfg,
            on_state_change: Box::new(on_state_change),
            state: Mutex::new(VadState::default()),
            now: now.unwrap_or_else(|| Arc::new(Instant::now)),
        })
    }

    /// Feeds one packet's audio level. Transitions fire the callback
    /// without holding the state lock beyond the decision.
    pub fn push_audio_level(&self, level: u8) {
        let ts = (self.now)();
        let transition = {
            let mut state = self.state.lock();

            if level < self.cfg.voice_level_threshold {
                state.last_active = Some(ts);

                if state.voice {
                    None
                } else {
                    match state.window_start {
                        Some(start) if ts.saturating_duration_since(start) <= self.cfg.activation_window => {
                            state.active_count += 1;
                        }
                        _ => {
                            state.window_start = Some(ts);
                            state.active_count = 1;
                        }
                    }

                    if state.active_count >= self.cfg.min_active_samples {
                        state.voice = true;
                        state.active_count = 0;
                        state.window_start = None;
                        Some(true)
                    } else {
                        None
                    }
                }
            } else if state.voice
                && state
                    .last_active
                    .map_or(true, |t| ts.saturating_duration_since(t) >= self.cfg.silence_after)
            {
                state.voice = false;
                Some(false)
            } else {
                None
            }
        };

        if let Some(voice) = transition {
            (self.on_state_change)(voice);
        }
    }

    /// Returns the monitor to silence without firing the callback. Used
    /// when the session mutes.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = VadState::default();
    }

    #[must_use]
    pub fn is_voice(&self) -> bool {
        self.state.lock().voice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manual_clock() -> (Clock, Arc<PMutex<Instant>>) {
        let current = Arc::new(PMutex::new(Instant::now()));
        let handle = Arc::clone(&current);
        let clock: Clock = Arc::new(move || *current.lock());
        (clock, handle)
    }

    #[test]
    fn test_config_validation() {
        let cfg = VadConfig {
            voice_level_threshold: 200,
            ..Default::default()
        };
        assert!(VadMonitor::new(cfg, |_| {}, None).is_err());

        let cfg = VadConfig {
            min_active_samples: 0,
            ..Default::default()
        };
        assert!(VadMonitor::new(cfg, |_| {}, None).is_err());
    }

    #[test]
    fn test_voice_on_after_sustained_activity() {
        let (clock, handle) = manual_clock();
        let events = Arc::new(PMutex::new(Vec::new()));
        let ev = Arc::clone(&events);
        let m = VadMonitor::new(
            VadConfig::default(),
            move |voice| ev.lock().push(voice),
            Some(clock),
        )
        .unwrap();

        for _ in 0..8 {
            m.push_audio_level(20);
            *handle.lock() += Duration::from_millis(20);
        }

        assert_eq!(events.lock().as_slice(), &[true]);
        assert!(m.is_voice());
    }

    #[test]
    fn test_voice_off_after_silence() {
        let (clock, handle) = manual_clock();
        let events = Arc::new(PMutex::new(Vec::new()));
        let ev = Arc::clone(&events);
        let m = VadMonitor::new(
            VadConfig::default(),
            move |voice| ev.lock().push(voice),
            Some(clock),
        )
        .unwrap();

        for _ in 0..8 {
            m.push_audio_level(20);
            *handle.lock() += Duration::from_millis(20);
        }
        assert!(m.is_voice());

        // Quiet packets past the silence window.
        *handle.lock() += Duration::from_secs(2);
        m.push_audio_level(120);

        assert_eq!(events.lock().as_slice(), &[true, false]);
        assert!(!m.is_voice());
    }

    #[test]
    fn test_sporadic_activity_stays_silent() {
        let (clock, handle) = manual_clock();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let m = VadMonitor::new(
            VadConfig::default(),
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Some(clock),
        )
        .unwrap();

        // One loud packet every second never accumulates enough samples
        // inside the activation window.
        for _ in 0..10 {
            m.push_audio_level(20);
            *handle.lock() += Duration::from_secs(1);
        }

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!m.is_voice());
    }

    #[test]
    fn test_reset_is_silent() {
        let (clock, handle) = manual_clock();
        let events = Arc::new(PMutex::new(Vec::new()));
        let ev = Arc::clone(&events);
        let m = VadMonitor::new(
            VadConfig::default(),
            move |voice| ev.lock().push(voice),
            Some(clock),
        )
        .unwrap();

        for _ in 0..8 {
            m.push_audio_level(20);
            *handle.lock() += Duration::from_millis(20);
        }
        assert!(m.is_voice());

        m.reset();
        assert!(!m.is_voice());
        // Only the activation event fired; reset itself is silent.
        assert_eq!(events.lock().as_slice(), &[true]);
    }
}
