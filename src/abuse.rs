//! Abuse controls applied before an alert submission touches storage.
//!
//! A [`RateLimiter`] keeps a sliding window of accepted timestamps per caller
//! key. [`AbuseGuard`] bundles the three configured policies: alert
//! submission (3 per 60s), account registration (5 per 15min), and login
//! (10 per 15min, with successful logins excluded from the count via
//! [`RateLimiter::forgive`]).
//!
//! Caller keys prefer a client-supplied device fingerprint header and fall
//! back to a network-address-derived key. The key is an opaque abuse-tracking
//! token only; it is never used to re-identify a person.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};

use crate::error::AlertError;

/// Header carrying the client-derived device fingerprint.
pub const FINGERPRINT_HEADER: &str = "x-device-fingerprint";

/// Maximum accepted submissions per key per window.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RatePolicy {
    /// Emergency alert submissions: 3 per 60 seconds.
    pub fn alerts() -> Self {
        Self {
            max_requests: 3,
            window: Duration::seconds(60),
        }
    }

    /// Account registration: 5 per 15 minutes.
    pub fn registration() -> Self {
        Self {
            max_requests: 5,
            window: Duration::minutes(15),
        }
    }

    /// Login attempts: 10 per 15 minutes; successes are forgiven.
    pub fn login() -> Self {
        Self {
            max_requests: 10,
            window: Duration::minutes(15),
        }
    }
}

/// Sliding-window rate limiter keyed by opaque caller key.
///
/// Admission check and counter increment happen under one lock so concurrent
/// bursts from the same key cannot undercount. Keys whose every hit has aged
/// out of the window are swept at most once per window, so rotated caller
/// keys do not accumulate for the life of the process.
pub struct RateLimiter {
    policy: RatePolicy,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    hits: HashMap<String, VecDeque<DateTime<Utc>>>,
    last_sweep: DateTime<Utc>,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(LimiterState {
                hits: HashMap::new(),
                last_sweep: Utc::now(),
            }),
        }
    }

    /// Admit or reject an attempt at time `now`.
    ///
    /// On rejection the error carries the remaining window in whole seconds,
    /// rounded up, as the suggested retry-after.
    pub fn admit(&self, key: &str, now: DateTime<Utc>) -> Result<(), AlertError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let window_start = now - self.policy.window;

        if now - state.last_sweep >= self.policy.window {
            state
                .hits
                .retain(|_, entry| entry.back().is_some_and(|&t| t > window_start));
            state.last_sweep = now;
        }

        let entry = state.hits.entry(key.to_string()).or_default();
        while entry.front().is_some_and(|&t| t <= window_start) {
            entry.pop_front();
        }

        if entry.len() >= self.policy.max_requests as usize {
            // Oldest hit still in the window decides when capacity frees up
            let oldest = entry.front().copied().unwrap_or(now);
            let remaining_ms = (oldest + self.policy.window - now).num_milliseconds().max(0);
            let retry_after_secs = (remaining_ms as u64).div_ceil(1000).max(1);
            return Err(AlertError::RateLimited { retry_after_secs });
        }

        entry.push_back(now);
        Ok(())
    }

    /// Remove the most recent recorded attempt for `key`.
    ///
    /// Used by the login policy so successful logins do not count against
    /// the window.
    pub fn forgive(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.hits.get_mut(key) {
            entry.pop_back();
            if entry.is_empty() {
                state.hits.remove(key);
            }
        }
    }

    /// Number of caller keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hits.len()
    }
}

/// Pre-persistence gate for abuse-prone endpoints.
pub struct AbuseGuard {
    alerts: RateLimiter,
    registration: RateLimiter,
    login: RateLimiter,
}

impl Default for AbuseGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl AbuseGuard {
    pub fn new() -> Self {
        Self {
            alerts: RateLimiter::new(RatePolicy::alerts()),
            registration: RateLimiter::new(RatePolicy::registration()),
            login: RateLimiter::new(RatePolicy::login()),
        }
    }

    /// Gate an alert submission.
    pub fn admit_alert(&self, key: &str, now: DateTime<Utc>) -> Result<(), AlertError> {
        self.alerts.admit(key, now)
    }

    /// Gate an account registration attempt.
    pub fn admit_registration(&self, key: &str, now: DateTime<Utc>) -> Result<(), AlertError> {
        self.registration.admit(key, now)
    }

    /// Gate a login attempt. Call [`AbuseGuard::login_succeeded`] afterwards
    /// on success so only failures accumulate.
    pub fn admit_login(&self, key: &str, now: DateTime<Utc>) -> Result<(), AlertError> {
        self.login.admit(key, now)
    }

    pub fn login_succeeded(&self, key: &str) {
        self.login.forgive(key);
    }
}

/// Derive the opaque caller key for a request.
///
/// Prefers the client fingerprint header; falls back to the forwarded
/// network address, then to a shared anonymous bucket.
pub fn caller_key(headers: &HeaderMap) -> String {
    if let Some(fp) = header_str(headers, FINGERPRINT_HEADER) {
        return format!("fp:{fp}");
    }
    if let Some(addr) = header_str(headers, "x-forwarded-for") {
        // First hop only; later entries are proxy-appended
        let first = addr.split(',').next().unwrap_or(addr).trim();
        return format!("net:{first}");
    }
    "net:unknown".to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
