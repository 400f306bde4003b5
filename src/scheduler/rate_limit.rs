//! Admission rate limits.
//!
//! Global: sliding 60s window over accepted instructions.
//! Per producer: fixed 60s window that resets on the first admission after
//! it lapses.

use crate::types::ProducerId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

const RATE_WINDOW_SECONDS: i64 = 60;

/// Which limit refused an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitExceeded {
    Global,
    Producer,
}

#[derive(Debug, Clone)]
struct ProducerWindow {
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    global_limit: Option<u32>,
    global_window: VecDeque<DateTime<Utc>>,
    producers: HashMap<ProducerId, ProducerWindow>,
}

impl RateLimiter {
    pub fn new(global_limit: Option<u32>) -> Self {
        Self {
            global_limit,
            global_window: VecDeque::new(),
            producers: HashMap::new(),
        }
    }

    /// Check both limits without consuming capacity.
    pub fn check(
        &mut self,
        producer: &ProducerId,
        producer_limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitExceeded> {
        let window = chrono::Duration::seconds(RATE_WINDOW_SECONDS);

        let window_start = now - window;
        while matches!(self.global_window.front(), Some(front) if *front <= window_start) {
            self.global_window.pop_front();
        }
        if let Some(limit) = self.global_limit {
            if self.global_window.len() >= limit as usize {
                return Err(RateLimitExceeded::Global);
            }
        }

        if let Some(limit) = producer_limit {
            let used = self
                .producers
                .get(producer)
                .filter(|w| now - w.started_at < window)
                .map_or(0, |w| w.count);
            if used >= limit {
                return Err(RateLimitExceeded::Producer);
            }
        }

        Ok(())
    }

    /// Count an accepted admission against both limits.
    pub fn record(&mut self, producer: &ProducerId, now: DateTime<Utc>) {
        let window = chrono::Duration::seconds(RATE_WINDOW_SECONDS);

        self.global_window.push_back(now);

        let entry = self
            .producers
            .entry(producer.clone())
            .or_insert(ProducerWindow {
                started_at: now,
                count: 0,
            });
        if now - entry.started_at >= window {
            entry.started_at = now;
            entry.count = 0;
        }
        entry.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_global_sliding_window() {
        let mut limiter = RateLimiter::new(Some(2));
        let producer = ProducerId::new("agent1");
        let t0 = Utc::now();

        for offset in [0, 20] {
            let now = t0 + Duration::seconds(offset);
            assert!(limiter.check(&producer, None, now).is_ok());
            limiter.record(&producer, now);
        }
        assert_eq!(
            limiter.check(&producer, None, t0 + Duration::seconds(40)),
            Err(RateLimitExceeded::Global)
        );
        // The first admission slides out after 60s; the second still counts.
        assert!(limiter.check(&producer, None, t0 + Duration::seconds(61)).is_ok());
    }

    #[test]
    fn test_producer_window_resets() {
        let mut limiter = RateLimiter::new(None);
        let producer = ProducerId::new("agent1");
        let other = ProducerId::new("agent2");
        let t0 = Utc::now();

        limiter.record(&producer, t0);
        assert_eq!(
            limiter.check(&producer, Some(1), t0 + Duration::seconds(59)),
            Err(RateLimitExceeded::Producer)
        );
        assert!(limiter.check(&other, Some(1), t0 + Duration::seconds(59)).is_ok());

        let later = t0 + Duration::seconds(60);
        assert!(limiter.check(&producer, Some(1), later).is_ok());
        limiter.record(&producer, later);
        assert!(limiter.check(&producer, Some(1), later).is_err());
    }

    #[test]
    fn test_check_does_not_consume() {
        let mut limiter = RateLimiter::new(Some(1));
        let producer = ProducerId::new("agent1");
        let now = Utc::now();
        for _ in 0..5 {
            assert!(limiter.check(&producer, Some(1), now).is_ok());
        }
    }
}
