//! Retry classification and backoff
//!
//! Retryable statuses are fixed: 401 (only after a forced token refresh),
//! 429, 500, 502, 503 and 504. Everything else outside the caller's
//! acceptable set fails immediately.
//!
//! Delay before a retry:
//! - `Retry-After` (seconds or HTTP-date) when present, clamped to the cap
//! - otherwise `min(max_delay, base * 2^attempt) * (1 + jitter)`, with
//!   `jitter` in `[0, jitter_fraction)`

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use common::RetrySettings;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::request::ApiResponse;

/// Statuses retried when outside the acceptable set.
pub const RETRYABLE_STATUSES: [u16; 6] = [401, 429, 500, 502, 503, 504];

/// What to do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// In the caller's acceptable set
    Accept,
    /// 401: force a token refresh, then retry
    RefreshAndRetry,
    /// Transient: back off and retry
    Retry,
    /// Not acceptable and not retryable
    Fail,
}

impl Disposition {
    pub fn label(self) -> &'static str {
        match self {
            Disposition::Accept => "accept",
            Disposition::RefreshAndRetry => "refresh_and_retry",
            Disposition::Retry => "retry",
            Disposition::Fail => "fail",
        }
    }
}

/// Classify a status against the caller's acceptable set.
pub fn classify(status: u16, acceptable: &[u16]) -> Disposition {
    if acceptable.contains(&status) {
        return Disposition::Accept;
    }
    match status {
        401 => Disposition::RefreshAndRetry,
        s if RETRYABLE_STATUSES.contains(&s) => Disposition::Retry,
        _ => Disposition::Fail,
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let at = SystemTime::from(date);
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

/// `Retry-After` of a response, if present and parseable.
pub fn retry_after(response: &ApiResponse, now: SystemTime) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|v| parse_retry_after(v, now))
}

/// Retry budget and backoff schedule for one client.
///
/// Owns its jitter source, seeded from the OS at construction.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
    retry_after_cap: Duration,
    max_elapsed: Option<Duration>,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::with_rng(settings, StdRng::from_rng(&mut rand::rng()))
    }

    /// Policy with an explicit jitter source.
    pub fn with_rng(settings: &RetrySettings, rng: StdRng) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            jitter_fraction: settings.jitter_fraction.clamp(0.0, 1.0),
            retry_after_cap: Duration::from_secs(settings.retry_after_cap_secs),
            max_elapsed: settings.max_elapsed_secs.map(Duration::from_secs),
            rng: Mutex::new(rng),
        }
    }

    /// Same settings, different wall-clock cap. Used for known slow calls.
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed
    }

    pub fn retry_after_cap(&self) -> Duration {
        self.retry_after_cap
    }

    /// Exponential delay with jitter for the given zero-based retry number.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        let exponential = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = if self.jitter_fraction > 0.0 {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.random::<f64>() * self.jitter_fraction
        } else {
            0.0
        };
        exponential.mul_f64(1.0 + jitter)
    }

    /// Delay before the next attempt: the server hint if any, else backoff.
    pub fn delay(&self, retry: u32, server_hint: Option<Duration>) -> Duration {
        match server_hint {
            Some(hint) => hint.min(self.retry_after_cap),
            None => self.backoff(retry),
        }
    }

    /// Whether another attempt fits in the budget.
    pub fn allows(&self, attempts_made: u32, elapsed: Duration, next_delay: Duration) -> bool {
        if attempts_made >= self.max_attempts {
            return false;
        }
        match self.max_elapsed {
            Some(cap) => elapsed.saturating_add(next_delay) <= cap,
            None => true,
        }
    }
}
