use crate::config::{RateLimitConfig, RateLimitSettings};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    Http,
    Connect,
    Auth,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allow() -> Self {
        RateDecision {
            allowed: true,
            retry_after: None,
        }
    }

    fn block(retry_after: Duration) -> Self {
        RateDecision {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

struct ClientWindow {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Sliding-window limiter with a penalty period per (scope, client) pair.
pub struct RateLimiter {
    settings: HashMap<RateScope, RateLimitSettings>,
    windows: Mutex<HashMap<(RateScope, String), ClientWindow>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut settings = HashMap::new();
        settings.insert(RateScope::Http, config.http.clone());
        settings.insert(RateScope::Connect, config.connect.clone());
        settings.insert(RateScope::Auth, config.auth.clone());
        RateLimiter {
            settings,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, scope: RateScope, client: &str) -> RateDecision {
        let Some(settings) = self.settings.get(&scope) else {
            return RateDecision::allow();
        };
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry((scope, client.to_string()))
            .or_insert_with(|| ClientWindow {
                hits: VecDeque::new(),
                blocked_until: None,
            });
        if let Some(until) = window.blocked_until {
            if now < until {
                return RateDecision::block(until.saturating_duration_since(now));
            }
            window.blocked_until = None;
            window.hits.clear();
        }
        while let Some(oldest) = window.hits.front() {
            if now.duration_since(*oldest) > settings.window {
                window.hits.pop_front();
            } else {
                break;
            }
        }
        if window.hits.len() < settings.burst as usize {
            window.hits.push_back(now);
            return RateDecision::allow();
        }
        if settings.penalty.is_zero() {
            return RateDecision::block(settings.window);
        }
        window.blocked_until = Some(now + settings.penalty);
        RateDecision::block(settings.penalty)
    }

    /// Drops windows that have been idle for longer than `idle`.
    pub async fn prune_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|(scope, _), window| {
            let keep_block = window
                .blocked_until
                .map(|until| until > now)
                .unwrap_or(false);
            let keep_hits = self
                .settings
                .get(scope)
                .and_then(|settings| {
                    window
                        .hits
                        .back()
                        .map(|last| now.duration_since(*last) < settings.window + idle)
                })
                .unwrap_or(false);
            keep_block || keep_hits
        });
        before - windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn tight_config() -> RateLimitConfig {
        let mut config = RateLimitConfig::default();
        config.http.burst = 2;
        config.http.window = Duration::from_millis(50);
        config.http.penalty = Duration::from_millis(80);
        config
    }

    #[tokio::test]
    async fn allows_within_burst() {
        let limiter = RateLimiter::new(&tight_config());
        assert!(limiter.check(RateScope::Http, "client").await.allowed);
        assert!(limiter.check(RateScope::Http, "client").await.allowed);
    }

    #[tokio::test]
    async fn blocks_then_recovers_after_penalty() {
        let limiter = RateLimiter::new(&tight_config());
        limiter.check(RateScope::Http, "client").await;
        limiter.check(RateScope::Http, "client").await;
        let decision = limiter.check(RateScope::Http, "client").await;
        assert!(!decision.allowed);
        assert!(decision.retry_after.unwrap() >= Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.check(RateScope::Http, "client").await.allowed);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let limiter = RateLimiter::new(&tight_config());
        limiter.check(RateScope::Http, "client").await;
        limiter.check(RateScope::Http, "client").await;
        assert!(!limiter.check(RateScope::Http, "client").await.allowed);
        assert!(limiter.check(RateScope::Auth, "client").await.allowed);
    }

    #[tokio::test]
    async fn idle_windows_are_pruned() {
        let limiter = RateLimiter::new(&tight_config());
        limiter.check(RateScope::Http, "client").await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let pruned = limiter.prune_idle(Duration::from_millis(10)).await;
        assert_eq!(pruned, 1);
    }
}
