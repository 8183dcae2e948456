use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::KeyValueStore;
use crate::config::RateLimitConfig;
use crate::error::{AppError, Result};
use crate::services::audit::{RateLimitDetails, SecurityEventLogger};

/// Decides whether `identifier` may make another request to `route`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Returns `AppError::RateLimitExceeded` when the budget is spent.
    async fn enforce_rate_limit(&self, route: &str, identifier: &str) -> Result<()>;
}

/// A request budget over a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteBudget {
    pub max_requests: u64,
    pub window: Duration,
}

impl From<&RateLimitConfig> for RouteBudget {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window,
        }
    }
}

/// Fixed-window counters kept in the shared store under
/// `rate_limit:{route}:{identifier}`.
pub struct StoreRateLimiter {
    store: Arc<dyn KeyValueStore>,
    default_budget: RouteBudget,
    overrides: HashMap<String, RouteBudget>,
    events: Arc<dyn SecurityEventLogger>,
}

impl StoreRateLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: &RateLimitConfig,
        events: Arc<dyn SecurityEventLogger>,
    ) -> Self {
        let overrides = HashMap::from([
            (
                "/api/auth/login".to_string(),
                RouteBudget {
                    max_requests: 5,
                    window: Duration::from_secs(15 * 60),
                },
            ),
            (
                "/api/auth/register".to_string(),
                RouteBudget {
                    max_requests: 3,
                    window: Duration::from_secs(3600),
                },
            ),
        ]);

        Self {
            store,
            default_budget: config.into(),
            overrides,
            events,
        }
    }

    pub fn with_override(mut self, route: &str, budget: RouteBudget) -> Self {
        self.overrides.insert(route.to_string(), budget);
        self
    }

    pub fn budget_for(&self, route: &str) -> RouteBudget {
        self.overrides
            .get(route)
            .copied()
            .unwrap_or(self.default_budget)
    }
}

#[async_trait]
impl RateLimiter for StoreRateLimiter {
    async fn enforce_rate_limit(&self, route: &str, identifier: &str) -> Result<()> {
        let budget = self.budget_for(route);
        let key = format!("rate_limit:{}:{}", route, identifier);
        let (current, remaining) = self.store.incr_window(&key, budget.window).await?;

        if current <= budget.max_requests {
            return Ok(());
        }

        let details = RateLimitDetails {
            route: route.to_string(),
            identifier: identifier.to_string(),
            limit: budget.max_requests,
            current,
            retry_after: remaining,
        };
        self.events.log_rate_limit_event("rate_limit_exceeded", &details);

        Err(AppError::RateLimitExceeded {
            limit: budget.max_requests,
            current,
            retry_after: remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::services::audit::{RecordedEvent, RecordingEventLogger};

    #[tokio::test]
    async fn login_budget_is_five_per_window() {
        let events = Arc::new(RecordingEventLogger::new());
        let limiter = StoreRateLimiter::new(
            Arc::new(MemoryStore::new()),
            &RateLimitConfig::default(),
            events.clone(),
        );

        for _ in 0..5 {
            limiter.enforce_rate_limit("/api/auth/login", "203.0.113.5").await.unwrap();
        }
        let err = limiter
            .enforce_rate_limit("/api/auth/login", "203.0.113.5")
            .await
            .unwrap_err();
        match err {
            AppError::RateLimitExceeded {
                limit,
                current,
                retry_after,
            } => {
                assert_eq!(limit, 5);
                assert_eq!(current, 6);
                assert!(retry_after > 0 && retry_after <= 900);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Other identifiers have their own window.
        limiter.enforce_rate_limit("/api/auth/login", "198.51.100.1").await.unwrap();
        assert!(matches!(
            events.events().as_slice(),
            [RecordedEvent::RateLimit(name, _)] if name == "rate_limit_exceeded"
        ));
    }

    #[test]
    fn unknown_routes_use_the_configured_default() {
        let limiter = StoreRateLimiter::new(
            Arc::new(MemoryStore::new()),
            &RateLimitConfig {
                max_requests: 7,
                window: Duration::from_secs(30),
            },
            Arc::new(RecordingEventLogger::new()),
        );
        assert_eq!(limiter.budget_for("/api/sessions").max_requests, 7);
        assert_eq!(limiter.budget_for("/api/auth/register").max_requests, 3);
    }
}
