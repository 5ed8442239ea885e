//! WASM module host for Wharf.
//!
//! This crate is the core of the tool server: it parses the declarative
//! manifest, materializes module references (local files or content-addressed
//! fetches), instantiates WASM plugins in a Wasmtime sandbox, and serializes
//! concurrent invocations per plugin. The server crate layers the RPC and
//! direct HTTP endpoints on top of [`PluginRegistry`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wharf_host::{ModuleResolver, PluginRegistry, SandboxEngine, ServerConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ServerConfig::from_file(Path::new("config/mcp_manifest.yaml"))?;
//! let engine = SandboxEngine::new()?;
//! let resolver = ModuleResolver::from_config(&config.ipfs);
//! let registry = Arc::new(PluginRegistry::new(engine, resolver, config.llm_config_json()));
//!
//! registry.load("file://./demos/say_hello.wat").await?;
//! let outcome = registry
//!     .call("file://./demos/say_hello.wat", "say_hello", b"World".to_vec(), Duration::from_secs(30))
//!     .await?;
//! assert_eq!(outcome.output, b"Hello, World!");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fetch;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod sandbox;

pub use error::{FetchError, ManifestError, RegistryError, ResolveError};
pub use fetch::ContentFetcher;
pub use manifest::{
    InputParam, IpfsConfig, LassieNet, ModuleDecl, OutputDecl, ServerConfig, ToolDecl,
};
pub use registry::{PluginHandle, PluginRegistry};
pub use resolver::{ModuleReference, ModuleResolver};
pub use sandbox::{GuestOutcome, SandboxEngine};
