//! Supervised forever-tasks
//!
//! A supervised task runs one attempt at a time: after a failure it waits the
//! retry delay, after a success the success delay, then runs again.

use crate::error::RelayerResult;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// Time source, injectable for tests
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Tokio's timer
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

pub struct Supervisor {
    name: String,
    retry_delay: Duration,
    success_delay: Duration,
    clock: Arc<dyn Clock>,
    /// Unbounded when unset
    max_iterations: Option<u64>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, retry_delay: Duration, success_delay: Duration) -> Self {
        Self {
            name: name.into(),
            retry_delay,
            success_delay,
            clock: Arc::new(TokioClock),
            max_iterations: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_iterations(mut self, max: u64) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Run `attempt` until the iteration bound, forever by default
    pub async fn run<F, Fut>(&self, mut attempt: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<()>>,
    {
        let mut iteration = 0u64;
        loop {
            if self.max_iterations.map_or(false, |max| iteration >= max) {
                return;
            }
            iteration += 1;

            match attempt().await {
                Ok(()) => self.clock.sleep(self.success_delay).await,
                Err(e) => {
                    if e.is_retryable() {
                        warn!(task = %self.name, error = %e, "Task attempt failed, retrying");
                    } else {
                        error!(task = %self.name, error = %e, "Task attempt failed, retrying");
                    }
                    crate::metrics::record_task_failure(&self.name);
                    self.clock.sleep(self.retry_delay).await;
                }
            }
        }
    }
}
