//! Thin MCP client for Wharf servers.
//!
//! Connects over exactly one of `--stdio CMD` (spawn a server child process)
//! or `--http URL` (streamable HTTP), prints the server info and tool list,
//! and optionally invokes a single tool with `--call`.

use anyhow::{bail, Context, Result};
use clap::Parser;

use rmcp::model::CallToolRequestParam;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "wharf-client",
    about = "Wharf client -- lists and calls tools on an MCP server"
)]
#[command(group(
    clap::ArgGroup::new("transport").required(true).args(["stdio", "http"])
))]
struct Cli {
    /// Command to spawn for a stdio transport (e.g. "wharfd --manifest m.yaml")
    #[arg(long)]
    stdio: Option<String>,

    /// Base URL of a streamable HTTP server (e.g. http://localhost:18080/)
    #[arg(long)]
    http: Option<String>,

    /// Tool to invoke after listing; its text output is printed to stdout
    #[arg(long)]
    call: Option<String>,

    /// JSON object passed as the tool arguments
    #[arg(long, default_value = "{}")]
    args: String,

    /// DeepSeek API key for LLM-assisted sessions (not bundled with this
    /// build; accepted for interface compatibility)
    #[arg(long, env = "DEEPSEEK_KEY")]
    deepseek_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_env("WHARF_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.deepseek_key.is_some() {
        tracing::warn!("LLM-assisted mode is not bundled with this build; the key is ignored");
    }

    let client = if let Some(command_line) = &cli.stdio {
        let parts = split_command(command_line);
        let Some((program, args)) = parts.split_first() else {
            bail!("--stdio command is empty");
        };
        tracing::info!(command = %program, "Connecting over stdio");

        let mut command = tokio::process::Command::new(program);
        command.args(args);
        let transport =
            TokioChildProcess::new(command).context("Failed to spawn the stdio server")?;
        ().serve(transport).await.context("MCP handshake failed")?
    } else if let Some(url) = &cli.http {
        tracing::info!(url = %url, "Connecting over streamable HTTP");
        let transport = StreamableHttpClientTransport::from_uri(url.clone());
        ().serve(transport).await.context("MCP handshake failed")?
    } else {
        // clap's transport group makes this unreachable.
        bail!("one of --stdio or --http is required");
    };

    if let Some(info) = client.peer_info() {
        println!(
            "Connected to {} (version {})",
            info.server_info.name, info.server_info.version
        );
    }

    let tools = client.list_all_tools().await.context("list_tools failed")?;
    println!("Available tools: {}", tools.len());
    for tool in &tools {
        println!("  - {}: {}", tool.name, tool.description.as_deref().unwrap_or(""));
    }

    if let Some(tool_name) = &cli.call {
        let arguments: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&cli.args).context("--args must be a JSON object")?;

        let result = client
            .call_tool(CallToolRequestParam {
                name: tool_name.clone().into(),
                arguments: Some(arguments),
            })
            .await
            .with_context(|| format!("call to {tool_name} failed"))?;

        let value = serde_json::to_value(&result)?;
        if value["isError"] == serde_json::Value::Bool(true) {
            tracing::warn!(tool = %tool_name, "Tool reported an error");
        }
        for content in value["content"].as_array().into_iter().flatten() {
            if let Some(text) = content["text"].as_str() {
                println!("{text}");
            }
        }
    }

    let _ = client.cancel().await;
    Ok(())
}

/// Split a command line into program + arguments, honoring single and
/// double quotes. No escape sequences.
fn split_command(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match (c, quote) {
            (' ', None) => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            ('"' | '\'', None) => quote = Some(c),
            (q, Some(active)) if q == active => quote = None,
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
