//! Sampling-side plumbing: retries, memoization, test doubles, and the
//! validator that turns model text into trusted JSON.

pub mod cache;
pub mod mock;
pub mod reliable;
pub mod retry;
pub mod validator;

pub use cache::{fingerprint, MemoizedSampler, TtlCache};
pub use mock::{MockResponse, MockSampler};
pub use reliable::{reliable_sampler, RetryingSampler};
pub use retry::{Backoff, RetryExecutor, RetryPolicy};
pub use validator::OutputValidator;
