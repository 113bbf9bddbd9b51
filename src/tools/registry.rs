//! Tool registry for Conduit
//!
//! The `ToolRegistry` holds the tools a run may call, hands out their
//! definitions for provider tool schemas, and looks them up by name.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::providers::ToolDefinition;

use super::filesystem::{DeleteFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use super::Tool;

/// A registry that holds and manages tools.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use conduit::tools::{ToolRegistry, EchoTool};
///
/// let mut registry = ToolRegistry::new();
/// registry.register(Arc::new(EchoTool));
///
/// assert!(registry.has("echo"));
/// assert_eq!(registry.definitions()[0].name, "echo");
/// ```
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    /// Register `read_file`, `write_file`, `list_dir` and `delete_file`.
    pub fn register_filesystem_tools(&mut self) {
        self.register(Arc::new(ReadFileTool));
        self.register(Arc::new(WriteFileTool));
        self.register(Arc::new(ListDirTool));
        self.register(Arc::new(DeleteFileTool));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool with the given name exists.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for provider tool schemas, sorted by name so the
    /// formatted prompt is stable across runs.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_registry_new() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.has("echo"));
        assert_eq!(registry.get("echo").unwrap().name(), "echo");
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].parameters["required"][0], "message");
    }

    #[test]
    fn test_register_filesystem_tools() {
        let mut registry = ToolRegistry::new();
        registry.register_filesystem_tools();
        assert_eq!(
            registry.names(),
            vec!["delete_file", "list_dir", "read_file", "write_file"]
        );
    }
}
