//! Per-sender sliding-window throttle for outgoing messages.
//!
//! State lives in this process only. Two processes sending as the same
//! agent each get their own window, so cross-process limiting is advisory.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RateLimitingConfig;

/// Idle senders are swept from the history once every this many checks.
const PRUNE_INTERVAL: usize = 256;

type History = HashMap<String, VecDeque<DateTime<Utc>>>;

pub struct RateLimiter {
    max_messages: usize,
    window: Duration,
    history: Mutex<History>,
    checks: AtomicUsize,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages: max_messages as usize,
            window,
            history: Mutex::new(HashMap::new()),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::new(
            config.messages_per_minute,
            Duration::from_secs(config.window_seconds),
        )
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Record a send at `now` if the sender is under its cap.
    ///
    /// Timestamps older than the window are evicted first. A rejected call
    /// leaves the history untouched apart from that eviction.
    pub fn allow(&self, sender_id: &str, now: DateTime<Utc>) -> bool {
        let cutoff = self.cutoff(now);
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_INTERVAL == 0 {
            retain_active(&mut history, cutoff);
        }
        let window = history.entry(sender_id.to_string()).or_default();
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
        if window.len() >= self.max_messages {
            tracing::debug!(
                sender = sender_id,
                sent = window.len(),
                max = self.max_messages,
                "rate limit exceeded"
            );
            return false;
        }
        window.push_back(now);
        true
    }

    /// How long until the sender's oldest send leaves the window.
    pub fn retry_after(&self, sender_id: &str, now: DateTime<Utc>) -> Duration {
        let history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(oldest) = history.get(sender_id).and_then(|w| w.front()) else {
            return Duration::ZERO;
        };
        let elapsed = (now - *oldest).to_std().unwrap_or(Duration::ZERO);
        self.window.saturating_sub(elapsed)
    }
}

fn retain_active(history: &mut History, cutoff: DateTime<Utc>) {
    history.retain(|_, w| w.back().is_some_and(|t| *t > cutoff));
}
