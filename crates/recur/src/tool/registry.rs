use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::llm::types::ToolDefinition;
use crate::tool::Tool;

/// Name→handler dispatch table.
///
/// The registry is shared across completions and mutated only between
/// them. Per-completion extra tools never pass through here; the engine
/// checks its extras list first during dispatch, so extras shadow global
/// entries of the same name without being observable elsewhere.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails with [`Error::ToolConflict`] when the name is
    /// already taken.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), Error> {
        let name = tool.definition().name;
        let mut tools = self.tools.write().expect("registry lock poisoned");
        if tools.contains_key(&name) {
            return Err(Error::ToolConflict(name));
        }
        tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool by name. Returns true when it was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Registered tool names, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Definitions of every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|t| t.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOutput;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;

    struct NamedTool(&'static str);

    impl Tool for NamedTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.0.into(),
                description: format!("tool {}", self.0),
                parameters: json!({"type": "object"}),
            }
        }

        fn execute(
            &self,
            _input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, crate::error::Error>> + Send + '_>>
        {
            Box::pin(async { Ok(ToolOutput::success("ok")) })
        }
    }

    #[test]
    fn register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("search"))).unwrap();
        assert!(registry.get("search").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("search"))).unwrap();
        let err = registry.register(Arc::new(NamedTool("search"))).unwrap_err();
        assert!(matches!(err, Error::ToolConflict(name) if name == "search"));
    }

    #[test]
    fn register_then_unregister_restores_snapshot() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("a"))).unwrap();
        let before = registry.list();

        registry.register(Arc::new(NamedTool("b"))).unwrap();
        assert!(registry.unregister("b"));
        assert_eq!(registry.list(), before);
    }

    #[test]
    fn unregister_missing_returns_false() {
        let registry = ToolRegistry::new();
        assert!(!registry.unregister("ghost"));
    }

    #[test]
    fn list_and_definitions_are_sorted() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("zeta"))).unwrap();
        registry.register(Arc::new(NamedTool("alpha"))).unwrap();
        assert_eq!(registry.list(), vec!["alpha", "zeta"]);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "alpha");
        assert_eq!(defs[1].name, "zeta");
    }
}
