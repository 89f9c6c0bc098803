pub mod diagnose;
pub mod ops;
pub mod session;

use std::sync::Arc;

use ckit_llm::RetryPolicy;

use crate::error::EngineError;
use crate::registry::ToolRegistry;

/// Registry holding every built-in tool.
pub fn default_registry() -> Result<ToolRegistry, EngineError> {
    default_registry_with_retry(RetryPolicy::default())
}

/// Built-in tools, with `retry` applied to the ones that declare retries.
pub fn default_registry_with_retry(retry: RetryPolicy) -> Result<ToolRegistry, EngineError> {
    let mut builder = ToolRegistry::builder();
    builder
        .register(Arc::new(ops::OpsTool::new()))?
        .register(Arc::new(session::SessionTool))?
        .register(Arc::new(diagnose::DiagnoseTool::new()?.with_retry(retry)))?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_registered() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.names(), vec!["diagnose", "ops", "session"]);
    }

    #[test]
    fn retry_policy_reaches_diagnose() {
        let registry = default_registry_with_retry(RetryPolicy::none()).unwrap();
        let diagnose = registry.get("diagnose").unwrap();
        assert_eq!(diagnose.tool().retry_policy(), Some(RetryPolicy::none()));
        assert_eq!(registry.get("ops").unwrap().tool().retry_policy(), None);
    }
}
