//! Per-service call spacing and throttling backoff.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use autotagger_shared::Service;

#[derive(Debug, Default)]
struct ServiceState {
    last_call: Option<Instant>,
    retry_count: u32,
}

/// Tracks the last call time and consecutive throttles of each [`Service`].
///
/// State is keyed per service, so a throttled store never slows the model
/// down and vice versa. Time comes from the tokio clock.
#[derive(Debug)]
pub struct RateLimiter {
    base_delay: Duration,
    max_backoff: Duration,
    services: HashMap<Service, ServiceState>,
}

impl RateLimiter {
    /// `base_delay` seeds the exponential backoff; `max_backoff` caps every wait.
    pub fn new(base_delay: Duration, max_backoff: Duration) -> Self {
        Self {
            base_delay,
            max_backoff,
            services: HashMap::new(),
        }
    }

    /// Sleep until `min_delay` has passed since the last call to `service`,
    /// then record this call.
    pub async fn wait_if_needed(&mut self, service: Service, min_delay: Duration) {
        let state = self.services.entry(service).or_default();

        if let Some(last) = state.last_call {
            let ready_at = last + min_delay;
            if ready_at > Instant::now() {
                debug!(%service, wait_ms = (ready_at - Instant::now()).as_millis() as u64, "spacing call");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        state.last_call = Some(Instant::now());
    }

    /// Register a throttling signal and return how long to back off.
    ///
    /// The server hint wins when present; otherwise the wait doubles with every
    /// consecutive throttle. Both are capped at `max_backoff`. Does not sleep.
    pub fn handle_rate_limit(&mut self, service: Service, retry_after: Option<Duration>) -> Duration {
        let state = self.services.entry(service).or_default();
        state.retry_count = state.retry_count.saturating_add(1);

        let wait = retry_after.unwrap_or_else(|| {
            let factor = 2u32.checked_pow(state.retry_count).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        let wait = wait.min(self.max_backoff);

        warn!(
            %service,
            retry = state.retry_count,
            wait_secs = wait.as_secs_f64(),
            "rate limited, backing off"
        );
        wait
    }

    /// Clear the consecutive-throttle counter after a successful call.
    pub fn reset_retry_count(&mut self, service: Service) {
        if let Some(state) = self.services.get_mut(&service) {
            state.retry_count = 0;
        }
    }

    pub fn retry_count(&self, service: Service) -> u32 {
        self.services.get(&service).map_or(0, |s| s.retry_count)
    }
}
