//! Declarative server manifest.
//!
//! The manifest is a YAML file read once at startup and immutable afterwards.
//! It declares the listen address, the WASM modules to load, the tools each
//! module exposes, and the content-addressed fetch settings. A malformed
//! manifest is fatal; everything else degrades per-module with warnings.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    /// Opt-in stateful streaming mode. The default streamable-HTTP transport
    /// cannot deliver server-initiated notifications; enabling this keeps a
    /// long-lived per-session stream open so pushes (e.g. tool-list changes)
    /// reach connected clients.
    #[serde(default)]
    pub continuous_listening: bool,
    /// Opaque block passed through verbatim. The host never interprets it;
    /// plugins can read it via the `config_read` host primitive.
    #[serde(default)]
    pub llm_config: serde_yaml::Value,
    #[serde(default)]
    pub modules: Vec<ModuleDecl>,
    #[serde(default)]
    pub ipfs: IpfsConfig,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    18080
}
fn default_max_connections() -> usize {
    256
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpfsConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub lassie_net: LassieNet,
    /// Seed content identifiers, recorded for operators; the host does not
    /// pre-fetch them.
    #[serde(default)]
    pub cids: Vec<String>,
}

/// Network location of the content-addressed retrieval gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LassieNet {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_scheme() -> String {
    "http".into()
}
fn default_gateway_host() -> String {
    "127.0.0.1".into()
}
fn default_gateway_port() -> u16 {
    62156
}

impl Default for LassieNet {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

/// A WASM module and the tools it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    /// Human label, used only in logs.
    pub name: String,
    /// Module reference: `file://PATH`, `IPFS://CID`, or a bare string.
    pub wasm_path: String,
    #[serde(default)]
    pub tools: Vec<ToolDecl>,
}

/// A declared tool. `name` must match a function exported by the owning
/// module; a mismatch is logged at bind time and the tool is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<InputParam>,
    #[serde(default)]
    pub outputs: OutputDecl,
}

/// Input parameter declaration. The `type` tag is documentation only; the
/// host forwards raw payloads without type-level validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_hint: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDecl {
    #[serde(rename = "type", default)]
    pub type_hint: String,
    #[serde(default)]
    pub description: String,
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// The `llm_config` block serialized as JSON, as handed to plugins via
    /// the `config_read` host primitive. Falls back to `{}` when the block
    /// is absent or not representable as JSON.
    pub fn llm_config_json(&self) -> Arc<str> {
        let json = match &self.llm_config {
            serde_yaml::Value::Null => "{}".to_string(),
            value => serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
        };
        json.into()
    }
}
