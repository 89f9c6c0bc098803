pub mod context;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod sanitize;
pub mod tool;
pub mod tools;

pub use context::{ContextFactory, Sampler, SessionHandle, ToolContext};
pub use error::EngineError;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use registry::{ToolRegistry, ToolRegistryBuilder};
pub use tool::{decode_params, Tool, ToolDefinition};
pub use tools::{default_registry, default_registry_with_retry};
