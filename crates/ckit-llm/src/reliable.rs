use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ckit_core::sampling::{SamplingClient, SamplingError, SamplingRequest, SamplingResponse};

use crate::cache::MemoizedSampler;
use crate::retry::{RetryExecutor, RetryPolicy};

/// Retries around `inner`, with memoization on top when `cache_ttl` is set.
///
/// Cache hits skip the retry schedule entirely.
pub fn reliable_sampler<S>(
    inner: S,
    policy: RetryPolicy,
    cache_ttl: Option<Duration>,
) -> Arc<dyn SamplingClient>
where
    S: SamplingClient + 'static,
{
    let retrying = RetryingSampler::new(inner, policy);
    match cache_ttl {
        Some(ttl) => Arc::new(MemoizedSampler::new(retrying, ttl)),
        None => Arc::new(retrying),
    }
}

/// Wraps a [`SamplingClient`] with the retry executor.
///
/// Only retryable channel errors (rate limits, unavailability, timeouts) are
/// retried; invalid requests and missing configuration fail at once.
pub struct RetryingSampler<S: SamplingClient> {
    inner: S,
    executor: RetryExecutor,
    total_retries: AtomicU64,
}

impl<S: SamplingClient> RetryingSampler<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self {
            inner,
            executor: RetryExecutor::new(policy),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: S) -> Self {
        Self::new(inner, RetryPolicy::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<S: SamplingClient> SamplingClient for RetryingSampler<S> {
    async fn create_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<SamplingResponse, SamplingError> {
        let inner = &self.inner;
        let retries = &self.total_retries;
        self.executor
            .run(
                move |attempt| {
                    if attempt > 0 {
                        retries.fetch_add(1, Ordering::Relaxed);
                    }
                    inner.create_message(request)
                },
                SamplingError::is_retryable,
            )
            .await
    }
}
