//! Tool binding: manifest declarations → dispatchable handlers.
//!
//! At startup the binder walks every loaded module's declared tools, checks
//! that the named function is actually exported (a mismatch is a warning,
//! never a startup failure), and records the surviving bindings in an
//! immutable [`BindingSet`] consumed by both endpoints. The registry is
//! passed in explicitly — bindings never smuggle a client handle through
//! request context.

use std::collections::HashMap;
use std::time::Duration;

use wharf_host::manifest::{ModuleDecl, ToolDecl};
use wharf_host::{GuestOutcome, PluginRegistry, RegistryError};

/// A bound tool: the declared name routed to its owning module.
#[derive(Debug, Clone)]
pub struct ToolBinding {
    pub name: String,
    pub description: String,
    pub module_ref: String,
    /// JSON schema derived from the declared inputs, for display in
    /// `list_tools`. The host performs no argument validation against it.
    pub input_schema: serde_json::Value,
}

/// The server's tool set, fixed after startup. Preserves registration order
/// for listings; first registration of a name wins.
#[derive(Debug, Default)]
pub struct BindingSet {
    order: Vec<ToolBinding>,
    index: HashMap<String, usize>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a binding. Returns false (and keeps the original) when the
    /// name is already bound.
    pub fn insert(&mut self, binding: ToolBinding) -> bool {
        if self.index.contains_key(&binding.name) {
            return false;
        }
        self.index.insert(binding.name.clone(), self.order.len());
        self.order.push(binding);
        true
    }

    pub fn get(&self, name: &str) -> Option<&ToolBinding> {
        self.index.get(name).map(|&i| &self.order[i])
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolBinding> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-call state created by an endpoint and consumed by dispatch.
#[derive(Debug)]
pub struct InvocationContext {
    pub caller: String,
    pub deadline: Duration,
    pub payload: Vec<u8>,
}

impl InvocationContext {
    pub fn new(caller: impl Into<String>, deadline: Duration, payload: Vec<u8>) -> Self {
        Self {
            caller: caller.into(),
            deadline,
            payload,
        }
    }
}

/// Register the tools of one loaded module into `set`.
pub async fn bind_module(registry: &PluginRegistry, module: &ModuleDecl, set: &mut BindingSet) {
    tracing::info!(
        module = %module.name,
        tools = module.tools.len(),
        "Registering module tools"
    );

    for tool in &module.tools {
        if tool.name.is_empty() {
            tracing::warn!(module = %module.name, "Tool with empty name, skipping");
            continue;
        }

        match registry.function_exists(&module.wasm_path, &tool.name).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    module = %module.name,
                    tool = %tool.name,
                    "Function not exported by module, skipping"
                );
                continue;
            }
            Err(e) => {
                tracing::warn!(
                    module = %module.name,
                    tool = %tool.name,
                    error = %e,
                    "Cannot inspect module exports, skipping"
                );
                continue;
            }
        }

        let binding = ToolBinding {
            name: tool.name.clone(),
            description: tool.description.clone(),
            module_ref: module.wasm_path.clone(),
            input_schema: input_schema(tool),
        };

        if set.insert(binding) {
            tracing::info!(tool = %tool.name, module = %module.name, "Tool registered");
        } else {
            tracing::warn!(
                tool = %tool.name,
                module = %module.name,
                "Duplicate tool name; first registration wins"
            );
        }
    }
}

/// Invoke the plugin behind a binding with the raw payload from `ctx`.
pub async fn dispatch(
    registry: &PluginRegistry,
    binding: &ToolBinding,
    ctx: InvocationContext,
) -> Result<GuestOutcome, RegistryError> {
    tracing::debug!(
        tool = %binding.name,
        caller = %ctx.caller,
        bytes = ctx.payload.len(),
        "Dispatching tool call"
    );
    registry
        .call(&binding.module_ref, &binding.name, ctx.payload, ctx.deadline)
        .await
}

/// JSON schema object for a tool's declared inputs.
fn input_schema(tool: &ToolDecl) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for input in &tool.inputs {
        let type_hint = if input.type_hint.is_empty() {
            "string"
        } else {
            input.type_hint.as_str()
        };
        properties.insert(
            input.name.clone(),
            serde_json::json!({
                "type": type_hint,
                "description": input.description,
            }),
        );
        if input.required {
            required.push(serde_json::Value::String(input.name.clone()));
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_host::manifest::InputParam;
    use wharf_host::{ModuleResolver, SandboxEngine};

    fn binding(name: &str) -> ToolBinding {
        ToolBinding {
            name: name.into(),
            description: String::new(),
            module_ref: "file://m.wasm".into(),
            input_schema: serde_json::json!({}),
        }
    }

    #[test]
    fn first_registration_wins() {
        let mut set = BindingSet::new();
        assert!(set.insert(ToolBinding {
            description: "first".into(),
            ..binding("dup")
        }));
        assert!(!set.insert(ToolBinding {
            description: "second".into(),
            ..binding("dup")
        }));

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("dup").unwrap().description, "first");
    }

    #[test]
    fn names_preserve_registration_order() {
        let mut set = BindingSet::new();
        set.insert(binding("zeta"));
        set.insert(binding("alpha"));
        assert_eq!(set.names(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn input_schema_reflects_declared_params() {
        let tool = ToolDecl {
            name: "convert".into(),
            description: "unit conversion".into(),
            inputs: vec![
                InputParam {
                    name: "value".into(),
                    type_hint: "number".into(),
                    required: true,
                    description: "the value".into(),
                },
                InputParam {
                    name: "unit".into(),
                    type_hint: String::new(),
                    required: false,
                    description: String::new(),
                },
            ],
            outputs: Default::default(),
        };

        let schema = input_schema(&tool);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["value"]["type"], "number");
        // Untyped params display as strings.
        assert_eq!(schema["properties"]["unit"]["type"], "string");
        assert_eq!(schema["required"], serde_json::json!(["value"]));
    }

    const ECHO_WAT: &str = r#"
(module
  (import "wharf" "input_read" (func $input_read (param i32) (result i32)))
  (import "wharf" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "echo") (result i32)
    (local $len i32)
    (local.set $len (call $input_read (i32.const 1024)))
    (drop (call $output_write (i32.const 1024) (local.get $len)))
    (i32.const 0)))
"#;

    #[tokio::test]
    async fn bind_module_skips_unexported_tools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.wat");
        std::fs::write(&path, ECHO_WAT).unwrap();
        let reference = format!("file://{}", path.display());

        let registry = PluginRegistry::new(
            SandboxEngine::new().unwrap(),
            ModuleResolver::local_only(),
            "{}".into(),
        );
        registry.load(&reference).await.unwrap();

        let module = ModuleDecl {
            name: "echo-module".into(),
            wasm_path: reference,
            tools: vec![
                ToolDecl {
                    name: "echo".into(),
                    description: "echoes".into(),
                    inputs: vec![],
                    outputs: Default::default(),
                },
                ToolDecl {
                    name: "ghost".into(),
                    description: "declared but not exported".into(),
                    inputs: vec![],
                    outputs: Default::default(),
                },
            ],
        };

        let mut set = BindingSet::new();
        bind_module(&registry, &module, &mut set).await;

        assert_eq!(set.names(), vec!["echo"]);
        assert!(set.get("ghost").is_none());
    }
}
