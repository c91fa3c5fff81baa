//! Tool contract and registry.
//!
//! Tools expose a fixed capability set: name, description, input/output
//! schemas, and `execute`. The registry is built during engine startup
//! and looked up by name; registration is the only dynamism.

mod calculator;
mod database;
mod rag;

pub use calculator::CalculatorTool;
pub use database::DatabaseTool;
pub use rag::RagTool;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::access::UserContext;
use crate::error::{Error, Result};

/// Per-invocation context: the verified caller and the remaining budget.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user: UserContext,
    /// Time left before the step's deadline.
    pub deadline: Duration,
    /// Conversation history lines, for tools that want them.
    pub history: Vec<String>,
}

impl ToolContext {
    pub fn new(user: UserContext, deadline: Duration) -> Self {
        Self {
            user,
            deadline,
            history: Vec::new(),
        }
    }
}

/// A pluggable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the expected input object.
    fn input_schema(&self) -> Value;

    /// JSON schema of the produced output object.
    fn output_schema(&self) -> Value;

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Name-keyed tool lookup, populated at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::tool(name, "unknown tool"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "repeats its input"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn output_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert!(registry.contains("echo"));
        assert_eq!(registry.names(), vec!["echo"]);

        let tool = registry.get("echo").unwrap();
        let ctx = ToolContext::new(UserContext::new(Uuid::new_v4()), Duration::from_secs(5));
        let output = tool.execute(json!({"x": 1}), &ctx).await.unwrap();
        assert_eq!(output["x"], 1);
    }

    #[test]
    fn test_unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
    }
}
