// Request spacing and advisory rate-limit state per backend
// Author: kelexine (https://github.com/kelexine)

use super::RateLimitStatus;
use crate::utils::retry::cap_retry_after;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct Observed {
    remaining: Option<u64>,
    blocked_until: Option<Instant>,
}

/// Spaces requests by a minimum interval and remembers what the backend
/// last said about its limits.
#[derive(Debug)]
pub struct RateLimiter {
    /// Next instant a request may start.
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
    observed: Mutex<Observed>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval,
            observed: Mutex::new(Observed::default()),
        }
    }

    /// Wait until both the spacing interval and any backend-requested pause have passed.
    pub async fn wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let blocked_until = self.observed.lock().blocked_until;
        let target = match blocked_until {
            Some(until) if until > *next => until,
            _ => *next,
        };

        let now = Instant::now();
        if target > now {
            debug!("Rate limiter waiting {}ms", (target - now).as_millis());
            tokio::time::sleep(target - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// Record limit headers from any response.
    pub fn observe_headers(&self, headers: &HeaderMap) {
        let remaining = header_u64(headers, "x-ratelimit-remaining-requests")
            .or_else(|| header_u64(headers, "anthropic-ratelimit-requests-remaining"));
        let reset = header_str(headers, "x-ratelimit-reset-requests")
            .and_then(parse_reset_duration)
            .or_else(|| {
                header_str(headers, "anthropic-ratelimit-requests-reset").and_then(parse_reset_instant)
            });

        let mut observed = self.observed.lock();
        if remaining.is_some() {
            observed.remaining = remaining;
        }
        if remaining == Some(0) {
            if let Some(reset) = reset {
                observed.blocked_until = Some(Instant::now() + cap_retry_after(reset));
            }
        }
    }

    /// Record an explicit rate-limit rejection.
    pub fn observe_rate_limited(&self, retry_after: Option<Duration>) {
        let pause = cap_retry_after(retry_after.unwrap_or(self.min_interval.max(Duration::from_secs(1))));
        let mut observed = self.observed.lock();
        observed.remaining = Some(0);
        observed.blocked_until = Some(Instant::now() + pause);
    }

    pub fn status(&self) -> RateLimitStatus {
        let observed = self.observed.lock();
        let now = Instant::now();
        let reset_after = observed
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_millis() as u64);

        RateLimitStatus {
            limited: reset_after.is_some(),
            remaining_requests: observed.remaining,
            reset_after_ms: reset_after,
            min_interval_ms: self.min_interval.as_millis() as u64,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

/// Durations like `1s`, `250ms`, `6m0s` or `1h2m3.5s`.
fn parse_reset_duration(raw: &str) -> Option<Duration> {
    let mut total = 0f64;
    let mut number = String::new();
    let mut chars = raw.chars().peekable();
    let mut matched = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let scale = match c {
            'h' => 3600.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += value * scale;
        matched = true;
    }

    if !number.is_empty() {
        // Bare number means seconds
        total += number.parse::<f64>().ok()?;
        matched = true;
    }

    matched.then(|| Duration::from_millis((total * 1000.0) as u64))
}

fn parse_reset_instant(raw: &str) -> Option<Duration> {
    let at = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    let delta = at.timestamp_millis() - chrono::Utc::now().timestamp_millis();
    Some(Duration::from_millis(delta.max(0) as u64))
}
