pub mod errors;
pub mod ids;
pub mod progress;
pub mod request;
pub mod sampling;
pub mod schema;
pub mod session;

pub use errors::{ErrorKind, ExecutionError, Failure, FieldIssue, Guidance, Outcome};
pub use ids::{RequestId, SessionId};
pub use request::{ExecutionRequest, RequestMetadata};
