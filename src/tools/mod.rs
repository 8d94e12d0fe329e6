//! Tool registration and the pseudo-function-calling prompt.
//!
//! Tools are registered once at startup; the registry is read-only
//! afterwards and shared across requests. It produces the machine
//! descriptors for backends with a native function-calling channel and the
//! teaching system prompt for backends without one.

pub mod browse;
pub mod search_web;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use browse::BrowseTool;
pub use search_web::SearchWebTool;

/// Machine-readable description of one registered tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// A named callable the interrogator can dispatch
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> Value;

    /// Run the tool. Errors are captured by the caller and fed back to the
    /// model as string output, never surfaced as loop failures.
    async fn invoke(&self, args: Value) -> Result<String>;
}

/// Envelope the teaching prompt asks the model to emit
pub const USE_TOOLS_INTENTION: &str = "USE_TOOLS";

/// Read-only collection of registered tools
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// System prompt teaching the model the JSON tool-call envelope.
    ///
    /// Identical across requests except for the embedded descriptor JSON
    /// and the enforcement clause added when the caller pins a tool.
    pub fn teaching_prompt(&self, pinned_tool: Option<&str>) -> String {
        let descriptors = serde_json::to_string_pretty(&self.descriptors())
            .unwrap_or_else(|_| "[]".to_string());
        let mut prompt = format!(
            "You have access to the following tools:\n\n{descriptors}\n\n\
             When you need one or more tools to answer, respond with ONLY a JSON object \
             of this exact shape and no other text:\n\
             {{\"intention\": \"{USE_TOOLS_INTENTION}\", \"thoughts\": \"<your reasoning>\", \
             \"tools\": [{{\"name\": \"<tool name>\", \"arguments\": {{}}, \"id\": \"<unique id>\"}}]}}\n\n\
             Each entry in \"tools\" is one invocation; \"arguments\" must match the tool's \
             parameter schema. When you do not need tools, answer the user directly and do \
             not emit this envelope."
        );
        if let Some(name) = pinned_tool {
            prompt.push_str(&format!(
                "\n\nYou MUST invoke the tool \"{name}\" before producing your final answer."
            ));
        }
        prompt
    }
}
