//! Server lifecycle.
//!
//! Startup order: manifest → one shared engine + registry → per-module
//! load/bind (continuing past failures) → both endpoints mounted on a single
//! router → serve. Shutdown: stop accepting, drain in-flight requests up to
//! the deadline, then abandon stragglers and close every plugin before
//! returning.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::{Peer, RoleServer};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tower::limit::GlobalConcurrencyLimitLayer;

use wharf_host::{ModuleResolver, PluginRegistry, SandboxEngine, ServerConfig};

use crate::binder::{self, BindingSet};
use crate::direct;
use crate::hooks::CallHooks;
use crate::rpc::RpcService;

/// How long in-flight requests may drain after a stop is requested.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// State shared by both endpoints. Built once at startup; the binding set
/// and config are immutable afterwards.
pub struct ServerState {
    pub registry: Arc<PluginRegistry>,
    pub bindings: Arc<BindingSet>,
    pub hooks: Arc<CallHooks>,
    pub request_timeout: Duration,
    pub continuous_listening: bool,
    /// Peers of sessions that initialized while continuous listening is on;
    /// targets for best-effort server notifications.
    peers: Mutex<Vec<Peer<RoleServer>>>,
}

impl ServerState {
    pub fn new(
        registry: Arc<PluginRegistry>,
        bindings: Arc<BindingSet>,
        hooks: Arc<CallHooks>,
        request_timeout: Duration,
        continuous_listening: bool,
    ) -> Self {
        Self {
            registry,
            bindings,
            hooks,
            request_timeout,
            continuous_listening,
            peers: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_peer(&self, peer: Peer<RoleServer>) {
        self.peers.lock().await.push(peer);
    }

    /// Best-effort `tools/list_changed` push to every registered peer.
    pub async fn notify_tool_list_changed(&self) {
        let peers = self.peers.lock().await.clone();
        for peer in peers {
            if let Err(e) = peer.notify_tool_list_changed().await {
                tracing::debug!(error = %e, "Tool list notification not delivered");
            }
        }
    }
}

/// Handle for requesting shutdown from another task (signal handler, tests).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct WharfServer {
    state: Arc<ServerState>,
    listener: TcpListener,
    router: Router,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl WharfServer {
    /// Construct the registry, load and bind every declared module, and bind
    /// the listen socket. Per-module failures are logged and skipped;
    /// manifest and socket errors are fatal.
    pub async fn start(config: ServerConfig) -> anyhow::Result<Self> {
        let engine = SandboxEngine::new().context("Failed to initialize WASM engine")?;
        let resolver = ModuleResolver::from_config(&config.ipfs);
        let registry = Arc::new(PluginRegistry::new(
            engine,
            resolver,
            config.llm_config_json(),
        ));

        if !config.ipfs.cids.is_empty() {
            tracing::info!(count = config.ipfs.cids.len(), "Seed CIDs configured");
        }

        let mut bindings = BindingSet::new();
        for module in &config.modules {
            tracing::info!(module = %module.name, path = %module.wasm_path, "Processing module");
            if let Err(e) = registry.load(&module.wasm_path).await {
                tracing::warn!(
                    module = %module.name,
                    path = %module.wasm_path,
                    error = %e,
                    "Failed to load module, skipping"
                );
                continue;
            }
            binder::bind_module(&registry, module, &mut bindings).await;
        }
        tracing::info!(tools = bindings.len(), "Tool binding complete");

        let state = Arc::new(ServerState::new(
            registry,
            Arc::new(bindings),
            Arc::new(CallHooks::with_logging()),
            config.request_timeout(),
            config.continuous_listening,
        ));

        // MCP at `/` through the streamable HTTP transport; the direct
        // routes take precedence on their own paths. Both surfaces consult
        // the one registry inside `state`.
        let rpc_service = StreamableHttpService::new(
            {
                let state = Arc::clone(&state);
                move || Ok(RpcService::new(Arc::clone(&state)))
            },
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig {
                sse_keep_alive: Some(Duration::from_secs(15)),
                stateful_mode: true,
            },
        );

        let router = direct::router(Arc::clone(&state))
            .fallback_service(rpc_service)
            .layer(GlobalConcurrencyLimitLayer::new(config.max_connections));

        let listener = TcpListener::bind(config.bind_addr())
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
        tracing::info!(addr = %listener.local_addr()?, "Wharf server listening");

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            state,
            listener,
            router,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Serve until shutdown is requested, then drain within `drain_deadline`
    /// and tear down every plugin. In-flight guest calls still running at
    /// the deadline are aborted; their callers observe a closed transport.
    pub async fn serve(self, drain_deadline: Duration) -> anyhow::Result<()> {
        let state = Arc::clone(&self.state);

        let mut graceful_rx = self.shutdown_tx.subscribe();
        let graceful = async move {
            let triggered = *graceful_rx.borrow_and_update();
            if !triggered {
                let _ = graceful_rx.changed().await;
            }
        };

        let mut forced_rx = self.shutdown_tx.subscribe();
        let forced = async move {
            let triggered = *forced_rx.borrow_and_update();
            if !triggered {
                let _ = forced_rx.changed().await;
            }
            tokio::time::sleep(drain_deadline).await;
        };

        let server = axum::serve(self.listener, self.router).with_graceful_shutdown(graceful);
        let mut server = std::pin::pin!(server.into_future());

        tokio::select! {
            result = &mut server => {
                result.context("HTTP server failed")?;
                tracing::info!("HTTP server drained");
            }
            () = forced => {
                tracing::warn!(
                    deadline = ?drain_deadline,
                    "Drain deadline exceeded, abandoning in-flight requests"
                );
            }
        }

        state.notify_tool_list_changed().await;
        state.registry.close().await;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
