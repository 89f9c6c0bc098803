use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ckit_core::sampling::{SamplingClient, SamplingError, SamplingRequest, SamplingResponse};

/// Pre-programmed responses for deterministic testing without a model.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Text(String),
    Error(SamplingError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Sampling client that replays scripted responses in order and records
/// every request it receives.
pub struct MockSampler {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<SamplingRequest>>,
}

impl MockSampler {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<SamplingRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SamplingClient for MockSampler {
    async fn create_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<SamplingResponse, SamplingError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let Some(mut current) = self.responses.get(idx).cloned() else {
            return Err(SamplingError::InvalidRequest(format!(
                "MockSampler: no response configured for call {idx}"
            )));
        };
        loop {
            match current {
                MockResponse::Text(text) => return Ok(SamplingResponse::text(text)),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}
