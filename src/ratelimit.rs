//! # Rate Limiter
//!
//! Per-identity, per-rule hit counters with time windows and penalty
//! extension.
//!
//! Accounting is optimistic: the counter is incremented *before* the
//! admission decision is finalized, so concurrent requests cannot sneak past
//! the limit in a burst. Each increment schedules its own decrement after
//! the window elapses; a rejected request's decrement still fires, which
//! self-corrects the counter. Crossing the limit extends the window by the
//! rule's penalty instead of resetting it.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One rate-limit rule, checked per request
#[derive(Debug, Clone, Deserialize)]
pub struct RateRule {
    /// Rule identifier, part of the counter key
    pub id: String,
    /// Hits admitted inside one window
    pub max_hits: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Window extension applied once the limit is crossed, in milliseconds
    #[serde(default)]
    pub penalty_ms: u64,
}

impl RateRule {
    /// Window length as a [`Duration`]
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Penalty extension as a [`Duration`]
    #[must_use]
    pub fn penalty(&self) -> Duration {
        Duration::from_millis(self.penalty_ms)
    }
}

/// Transport a counter is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Plain HTTP request
    Http,
    /// WebSocket connection / message
    Ws,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Ws => write!(f, "ws"),
        }
    }
}

/// Counter key: transport kind, client IP, rule identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    /// Transport the hit arrived on
    pub transport: Transport,
    /// Client identity
    pub ip: IpAddr,
    /// Identifier of the rule being counted
    pub rule: String,
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.transport, self.ip, self.rule)
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone)]
pub struct RateDecision {
    /// Whether the request is admitted
    pub admitted: bool,
    /// Hits left inside the current window
    pub remaining: u32,
    /// The rule's limit, for response headers
    pub limit: u32,
    /// Time until the window resets
    pub reset_in: Duration,
}

#[derive(Debug)]
struct Counter {
    hits: u32,
    window_ends_at: Instant,
}

/// Per-identity, per-rule rate limiter
///
/// Counters live behind one `Mutex`, making each read-increment-write
/// atomic under true parallelism.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    counters: Arc<Mutex<HashMap<RateKey, Counter>>>,
}

impl RateLimiter {
    /// Create an empty limiter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a hit for `key` under `rule` and decide admission
    ///
    /// Must run inside a tokio runtime: every hit schedules its own
    /// deferred decrement.
    pub fn check(&self, key: &RateKey, rule: &RateRule) -> RateDecision {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        let counter = counters.entry(key.clone()).or_insert(Counter {
            hits: 0,
            window_ends_at: now + rule.window(),
        });
        if now >= counter.window_ends_at {
            counter.hits = 0;
            counter.window_ends_at = now + rule.window();
        }

        let before = counter.hits;
        counter.hits += 1;

        if before == rule.max_hits {
            // penalty state: the window stretches instead of resetting
            counter.window_ends_at += rule.penalty();
            debug!(key = %key, penalty_ms = rule.penalty_ms, "Rate limit penalty applied");
        }

        let decision = RateDecision {
            admitted: counter.hits <= rule.max_hits,
            remaining: rule.max_hits.saturating_sub(counter.hits),
            limit: rule.max_hits,
            reset_in: counter.window_ends_at.saturating_duration_since(now),
        };
        drop(counters);

        self.schedule_decrement(key.clone(), rule.window());
        decision
    }

    /// Undo the optimistic increment for a request that should not count
    pub fn skip(&self, key: &RateKey) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = counters.get_mut(key) {
            counter.hits = counter.hits.saturating_sub(1);
        }
    }

    /// Remove the counter outright
    pub fn clear(&self, key: &RateKey) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.remove(key);
    }

    /// Current hit count for a key (zero when no counter exists)
    #[must_use]
    pub fn hits(&self, key: &RateKey) -> u32 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(key).map_or(0, |c| c.hits)
    }

    fn schedule_decrement(&self, key: RateKey, window: Duration) {
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut counters = counters.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = counters.get_mut(&key) {
                counter.hits = counter.hits.saturating_sub(1);
                if counter.hits == 0 {
                    counters.remove(&key);
                }
            }
        });
    }
}
