//! MCP endpoint.
//!
//! One `RpcService` is created per transport session; all sessions share the
//! same [`ServerState`]. `initialize` must complete on a session before
//! `call_tool` is accepted there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, Content, InitializeRequestParam,
        InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
        PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
};

use crate::binder::{self, InvocationContext, ToolBinding};
use crate::supervisor::ServerState;

#[derive(Clone)]
pub struct RpcService {
    state: Arc<ServerState>,
    /// Set once `initialize` completes on this session.
    initialized: Arc<AtomicBool>,
}

impl RpcService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(McpError::invalid_request(
                "initialize must complete before call_tool",
                None,
            ))
        }
    }
}

fn wharf_info() -> InitializeResult {
    InitializeResult {
        protocol_version: Default::default(),
        capabilities: ServerCapabilities::builder()
            .enable_tools()
            .enable_resources()
            .enable_prompts()
            .enable_logging()
            .build(),
        server_info: rmcp::model::Implementation::from_build_env(),
        instructions: Some("Wharf module host -- WASM tools over MCP and HTTP".into()),
    }
}

fn binding_to_tool(binding: &ToolBinding) -> Tool {
    Tool {
        name: binding.name.clone().into(),
        title: None,
        description: Some(binding.description.clone().into()),
        input_schema: binding
            .input_schema
            .as_object()
            .cloned()
            .unwrap_or_default()
            .into(),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

impl ServerHandler for RpcService {
    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        self.initialized.store(true, Ordering::SeqCst);
        if self.state.continuous_listening {
            self.state.register_peer(context.peer.clone()).await;
        }
        Ok(wharf_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        self.state.hooks.fire_before("list_tools", None);

        let tools = self.state.bindings.iter().map(binding_to_tool).collect();

        self.state.hooks.fire_success("list_tools", None);
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_initialized()?;

        let tool_name = request.name.to_string();
        self.state.hooks.fire_before("call_tool", Some(&tool_name));

        let Some(binding) = self.state.bindings.get(&tool_name) else {
            self.state
                .hooks
                .fire_error("call_tool", Some(&tool_name), "tool not found");
            return Err(McpError::invalid_params(
                format!("tool not found: {tool_name}"),
                None,
            ));
        };

        // The whole request-params structure is the guest's input.
        let payload = serde_json::to_vec(&request).map_err(|e| {
            McpError::internal_error(format!("cannot serialize arguments: {e}"), None)
        })?;

        let ctx = InvocationContext::new(
            format!("rpc:{:?}", context.id),
            self.state.request_timeout,
            payload,
        );

        match binder::dispatch(&self.state.registry, binding, ctx).await {
            Ok(outcome) => {
                self.state.hooks.fire_success("call_tool", Some(&tool_name));
                let text = String::from_utf8_lossy(&outcome.output).into_owned();
                Ok(CallToolResult {
                    content: vec![Content::text(text)],
                    structured_content: None,
                    is_error: Some(outcome.status != 0),
                    meta: None,
                })
            }
            Err(e) => {
                self.state
                    .hooks
                    .fire_error("call_tool", Some(&tool_name), &e.to_string());
                Err(McpError::internal_error(
                    format!("tool call failed: {e}"),
                    Some(serde_json::json!({ "code": e.code() })),
                ))
            }
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult::default())
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult::default())
    }

    fn get_info(&self) -> ServerInfo {
        let result = wharf_info();
        ServerInfo {
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
            server_info: result.server_info,
            instructions: result.instructions,
        }
    }
}
