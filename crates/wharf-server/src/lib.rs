//! Wharf tool server.
//!
//! Layers two surfaces over the module host in `wharf-host`:
//! the MCP endpoint (streamable HTTP at `/`) and the direct REST-style
//! endpoint (`GET /tools`, `POST /tools/{name}`). Both consult the single
//! shared [`PluginRegistry`](wharf_host::PluginRegistry) built at startup.

pub mod binder;
pub mod direct;
pub mod hooks;
pub mod rpc;
pub mod supervisor;

pub use binder::{BindingSet, InvocationContext, ToolBinding};
pub use hooks::CallHooks;
pub use supervisor::{ServerState, ShutdownHandle, WharfServer};
