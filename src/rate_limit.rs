//! 分层固定窗口限流（例如 "5 per minute; 50 per hour; 200 per day"）。

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::RateLimitScope;

/// 单层限额：窗口内最多允许 `limit` 次。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateTier {
    pub limit: NonZeroU32,
    pub window: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RatePolicyError(pub String);

impl std::fmt::Display for RatePolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid rate limit: {}", self.0)
    }
}

/// 解析以 `;` 或 `,` 分隔的限额列表，每项形如 `5 per minute` 或 `5/minute`。
pub fn parse_policy(policy: &str) -> Result<Vec<RateTier>, RatePolicyError> {
    let mut tiers = Vec::new();
    for item in policy.split([';', ',']).map(str::trim).filter(|s| !s.is_empty()) {
        let (count, unit) = match item.split_once('/') {
            Some((count, unit)) => (count.trim(), unit.trim()),
            None => {
                let mut parts = item.split_whitespace();
                let count = parts.next().unwrap_or_default();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some("per"), Some(unit), None) => (count, unit),
                    _ => return Err(RatePolicyError(item.to_string())),
                }
            }
        };
        let limit = count
            .parse::<NonZeroU32>()
            .map_err(|_| RatePolicyError(item.to_string()))?;
        let window = match unit.to_ascii_lowercase().trim_end_matches('s') {
            "second" | "sec" => Duration::from_secs(1),
            "minute" | "min" => Duration::from_secs(60),
            "hour" => Duration::from_secs(60 * 60),
            "day" => Duration::from_secs(24 * 60 * 60),
            _ => return Err(RatePolicyError(item.to_string())),
        };
        tiers.push(RateTier { limit, window });
    }
    if tiers.is_empty() {
        return Err(RatePolicyError(policy.to_string()));
    }
    Ok(tiers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RateKey {
    Global,
    Client(IpAddr),
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// 上传尝试计数器。检查与递增在同一把锁内完成，并发突发不会少计。
#[derive(Debug)]
pub struct RateLimiter {
    tiers: Vec<RateTier>,
    scope: RateLimitScope,
    windows: Mutex<HashMap<RateKey, Vec<Window>>>,
}

impl RateLimiter {
    pub fn new(tiers: Vec<RateTier>, scope: RateLimitScope) -> Self {
        Self {
            tiers,
            scope,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 记录一次尝试；超出任一层限额时返回距该窗口重置的秒数，且不计数。
    pub async fn try_acquire(&self, client: Option<IpAddr>) -> Result<(), u64> {
        self.try_acquire_at(client, Instant::now()).await
    }

    async fn try_acquire_at(&self, client: Option<IpAddr>, now: Instant) -> Result<(), u64> {
        let key = match (self.scope, client) {
            (RateLimitScope::Client, Some(ip)) => RateKey::Client(ip),
            _ => RateKey::Global,
        };

        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key).or_insert_with(|| {
            vec![
                Window {
                    started: now,
                    count: 0,
                };
                self.tiers.len()
            ]
        });

        let mut retry_after = None;
        for (tier, window) in self.tiers.iter().zip(entry.iter_mut()) {
            if now.duration_since(window.started) >= tier.window {
                window.started = now;
                window.count = 0;
            }
            if window.count >= tier.limit.get() {
                let remaining = tier
                    .window
                    .saturating_sub(now.duration_since(window.started));
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                retry_after = retry_after.max(Some(secs));
            }
        }

        if let Some(secs) = retry_after {
            warn!(?key, retry_after = secs, "upload rate limit exceeded");
            return Err(secs);
        }
        for window in entry.iter_mut() {
            window.count += 1;
        }
        Ok(())
    }

    /// 清理所有层窗口均已过期的客户端记录。
    pub async fn prune(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, entry| {
            self.tiers
                .iter()
                .zip(entry.iter())
                .any(|(tier, window)| now.duration_since(window.started) < tier.window)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tier(limit: u32, secs: u64) -> RateTier {
        RateTier {
            limit: NonZeroU32::new(limit).expect("non-zero"),
            window: Duration::from_secs(secs),
        }
    }

    #[test]
    fn parses_layered_policy() {
        let tiers = parse_policy("5 per minute; 50 per hour, 200/day").expect("parse");
        assert_eq!(tiers, vec![tier(5, 60), tier(50, 3600), tier(200, 86400)]);
    }

    #[test]
    fn rejects_malformed_policy() {
        assert!(parse_policy("").is_err());
        assert!(parse_policy("0 per minute").is_err());
        assert!(parse_policy("five per minute").is_err());
        assert!(parse_policy("5 per fortnight").is_err());
        assert!(parse_policy("5 every minute").is_err());
    }

    #[tokio::test]
    async fn blocks_after_limit_and_resets_with_window() {
        let limiter = RateLimiter::new(vec![tier(2, 60)], RateLimitScope::Global);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(None, start).await.is_ok());
        assert!(limiter.try_acquire_at(None, start).await.is_ok());
        let retry = limiter
            .try_acquire_at(None, start + Duration::from_secs(10))
            .await
            .expect_err("third attempt blocked");
        assert_eq!(retry, 50);
        assert!(
            limiter
                .try_acquire_at(None, start + Duration::from_secs(60))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn tightest_tier_wins() {
        let limiter = RateLimiter::new(vec![tier(5, 60), tier(6, 3600)], RateLimitScope::Global);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_acquire_at(None, start).await.is_ok());
        }
        assert!(limiter.try_acquire_at(None, start).await.is_err());
        let later = start + Duration::from_secs(61);
        assert!(limiter.try_acquire_at(None, later).await.is_ok());
        let retry = limiter.try_acquire_at(None, later).await.expect_err("hour tier");
        assert_eq!(retry, 3600 - 61);
    }

    #[tokio::test]
    async fn client_scope_keys_by_ip() {
        let limiter = RateLimiter::new(vec![tier(1, 60)], RateLimitScope::Client);
        let a: IpAddr = "10.0.0.1".parse().expect("ip");
        let b: IpAddr = "10.0.0.2".parse().expect("ip");
        assert!(limiter.try_acquire(Some(a)).await.is_ok());
        assert!(limiter.try_acquire(Some(a)).await.is_err());
        assert!(limiter.try_acquire(Some(b)).await.is_ok());
    }

    #[tokio::test]
    async fn global_scope_ignores_client() {
        let limiter = RateLimiter::new(vec![tier(1, 60)], RateLimitScope::Global);
        assert!(limiter.try_acquire(Some("10.0.0.1".parse().expect("ip"))).await.is_ok());
        assert!(limiter.try_acquire(Some("10.0.0.2".parse().expect("ip"))).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_attempts_admit_exactly_the_cap() {
        let limiter = Arc::new(RateLimiter::new(vec![tier(5, 60)], RateLimitScope::Global));
        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire(None).await.is_ok() })
            })
            .collect();
        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn prune_drops_expired_entries() {
        let limiter = RateLimiter::new(vec![tier(1, 60)], RateLimitScope::Client);
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(120)) else {
            return;
        };
        let ip: IpAddr = "10.0.0.9".parse().expect("ip");
        assert!(limiter.try_acquire_at(Some(ip), old).await.is_ok());
        limiter.prune().await;
        assert!(limiter.windows.lock().await.is_empty());
    }
}
