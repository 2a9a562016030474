//! Bounded retries with exponential backoff, jitter, and a windowed retry
//! budget.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// N: failures beyond this many are not retried again (at most N+1 total attempts).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// j ∈ [0,1].
    pub jitter_factor: f64,
    /// (B, W): at most B retries consumed within any rolling window of W.
    pub budget: Option<(u32, Duration)>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
            budget: None,
        }
    }
}

/// `min(dₘ, d₀·mᵏ)`, the pre-jitter backoff base for attempt index `k`.
fn base_delay(cfg: &RetryConfig, k: u32) -> Duration {
    let factor = cfg.multiplier.powi(k as i32);
    let millis = (cfg.initial_delay.as_secs_f64() * factor * 1000.0).min(f64::MAX);
    let capped = millis.min(cfg.max_delay.as_millis() as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

fn jittered_delay(cfg: &RetryConfig, k: u32) -> Duration {
    let base = base_delay(cfg, k);
    if cfg.jitter_factor <= 0.0 {
        return base;
    }
    let u = rand::thread_rng().gen_range(-cfg.jitter_factor..=cfg.jitter_factor);
    let scaled = base.as_secs_f64() * (1.0 + u);
    Duration::from_secs_f64(scaled.max(0.0))
}

/// Shared, serialized retry-token budget; concurrent callers share it.
struct BudgetState {
    count: u32,
    window_start: Instant,
}

pub struct RetryBudget {
    limit: u32,
    window: Duration,
    state: Mutex<BudgetState>,
}

impl RetryBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(BudgetState {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Returns `false` if the budget is exhausted for the current window.
    fn try_consume(&self) -> bool {
        let mut s = self.state.lock().expect("retry budget mutex poisoned");
        let now = Instant::now();
        if now.duration_since(s.window_start) >= self.window {
            s.count = 0;
            s.window_start = now;
        }
        if s.count >= self.limit {
            return false;
        }
        s.count += 1;
        true
    }
}

pub struct RetryPolicy {
    config: RetryConfig,
    budget: Option<RetryBudget>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let budget = config.budget.map(|(b, w)| RetryBudget::new(b, w));
        Self { config, budget }
    }

    /// `execute_with_result(ctx, fn) -> (T, err)`. `f` is invoked once per
    /// attempt; it is not invoked at all if `cancel` is already cancelled.
    pub async fn execute_with_result<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }

        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::cancelled());
            }
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable || attempt == self.config.max_attempts {
                        break;
                    }
                    if let Some(budget) = &self.budget {
                        if !budget.try_consume() {
                            break;
                        }
                    }
                    let delay = jittered_delay(&self.config, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::cancelled()),
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("retry loop produced no error".into())))
    }

    /// `execute(ctx, fn) -> err`, for operations with no useful return value.
    pub async fn execute<F, Fut>(&self, cancel: &CancellationToken, f: F) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        self.execute_with_result(cancel, f).await
    }
}
