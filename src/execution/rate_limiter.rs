use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::{BucketConfig, RateLimitConfig};

/// Venue endpoint class, each with its own budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    MarketData,
    Order,
    Account,
}

impl RateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::MarketData => "market_data",
            RateCategory::Order => "order",
            RateCategory::Account => "account",
        }
    }
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token bucket state
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    fn new(config: &BucketConfig) -> Self {
        Self {
            tokens: config.capacity as f64,
            last_refill: Instant::now(),
            capacity: config.capacity as f64,
            refill_per_sec: config.refill_per_sec,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available
    fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else if self.refill_per_sec > 0.0 {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec))
        } else {
            Err(Duration::from_secs(1))
        }
    }
}

/// One token bucket per [`RateCategory`], consulted before every venue call
#[derive(Debug)]
pub struct RateLimiter {
    buckets: HashMap<RateCategory, Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let buckets = [
            (RateCategory::MarketData, &config.market_data),
            (RateCategory::Order, &config.order),
            (RateCategory::Account, &config.account),
        ]
        .into_iter()
        .map(|(category, bucket)| (category, Mutex::new(TokenBucket::new(bucket))))
        .collect();
        Self { buckets }
    }

    /// Wait until a token is available for `category`
    pub async fn acquire(&self, category: RateCategory) {
        let Some(bucket) = self.buckets.get(&category) else {
            return;
        };
        loop {
            let wait = match bucket.lock().await.try_take() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            debug!(%category, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            sleep(wait).await;
        }
    }

    /// Take a token without waiting
    pub async fn try_acquire(&self, category: RateCategory) -> bool {
        match self.buckets.get(&category) {
            Some(bucket) => bucket.lock().await.try_take().is_ok(),
            None => true,
        }
    }

    pub async fn available(&self, category: RateCategory) -> f64 {
        match self.buckets.get(&category) {
            Some(bucket) => {
                let mut bucket = bucket.lock().await;
                bucket.refill();
                bucket.tokens
            }
            None => f64::INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            market_data: BucketConfig {
                capacity: 2,
                refill_per_sec: 10.0,
            },
            order: BucketConfig {
                capacity: 1,
                refill_per_sec: 1.0,
            },
            account: BucketConfig {
                capacity: 1,
                refill_per_sec: 1.0,
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_categories_have_separate_budgets() {
        let limiter = limiter();
        assert!(limiter.try_acquire(RateCategory::Order).await);
        assert!(!limiter.try_acquire(RateCategory::Order).await);
        // Order exhaustion does not affect market data
        assert!(limiter.try_acquire(RateCategory::MarketData).await);
        assert!(limiter.try_acquire(RateCategory::MarketData).await);
        assert!(!limiter.try_acquire(RateCategory::MarketData).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = limiter();
        limiter.acquire(RateCategory::Order).await;
        let start = Instant::now();
        limiter.acquire(RateCategory::Order).await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }
}
