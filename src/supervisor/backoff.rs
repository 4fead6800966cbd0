//! Restart backoff

use crate::config::SupervisorSettings;
use std::time::Duration;

/// Exponential backoff indexed by consecutive crash count
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first crash
    pub initial: Duration,

    /// Upper bound for any delay
    pub max: Duration,

    /// Growth factor per consecutive crash
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.initial_backoff_secs),
            Duration::from_secs(settings.max_backoff_secs),
            settings.multiplier,
        )
    }

    /// Delay before restarting after `consecutive_crashes` crashes in a row
    pub fn delay(&self, consecutive_crashes: u32) -> Duration {
        let attempt = consecutive_crashes.saturating_sub(1).min(i32::MAX as u32);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max
        }
    }
}
