use std::future::Future;
use std::time::Duration;

use domain::{GatewayError, GatewayResult};
use tokio::time::sleep;
use tracing::debug;

#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base }
    }

    fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                base.saturating_mul(factor)
            }
        }
    }
}

/// 只读请求的重试策略；写请求从不重试
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::exponential(Duration::from_millis(200)),
        }
    }
}

fn is_retryable(err: &GatewayError) -> bool {
    matches!(err, GatewayError::Transport { .. })
}

pub async fn retry_async<F, Fut, T>(config: &RetryConfig, mut op: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = config.backoff.delay_at(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "请求失败，稍后重试");
                sleep(delay).await;
            }
        }
    }
}
