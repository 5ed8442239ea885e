//! Live plugin registry.
//!
//! `PluginRegistry` owns every instantiated plugin, keyed by the exact
//! textual form of its module reference. Loading is idempotent per
//! reference; calls are serialized per plugin and run in parallel across
//! plugins.
//!
//! # Locking
//!
//! The registry's own mutex guards the handle map only and is held just for
//! insert/lookup — never across a guest call. Each [`PluginHandle`] carries
//! its own FIFO mutex held for the duration of the guest call, which is what
//! serializes invocations into a plugin whose linear memory is not safe for
//! concurrent entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};

use crate::error::RegistryError;
use crate::resolver::ModuleResolver;
use crate::sandbox::{GuestOutcome, InvokeError, PluginInstance, SandboxEngine};

/// An instantiated plugin owned by the registry. The inner mutex serializes
/// guest calls; `None` after the registry has closed the plugin.
pub struct PluginHandle {
    reference: String,
    instance: Mutex<Option<PluginInstance>>,
}

impl PluginHandle {
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

pub struct PluginRegistry {
    engine: SandboxEngine,
    resolver: ModuleResolver,
    config_json: Arc<str>,
    plugins: Mutex<HashMap<String, Arc<PluginHandle>>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl PluginRegistry {
    pub fn new(engine: SandboxEngine, resolver: ModuleResolver, config_json: Arc<str>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            resolver,
            config_json,
            plugins: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Load a module by reference. Idempotent: a reference that is already
    /// loaded returns the existing handle without re-instantiation.
    pub async fn load(&self, reference: &str) -> Result<Arc<PluginHandle>, RegistryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Shutdown);
        }

        {
            let plugins = self.plugins.lock().await;
            if let Some(handle) = plugins.get(reference) {
                tracing::debug!(module = reference, "Module already loaded");
                return Ok(Arc::clone(handle));
            }
        }

        tracing::info!(module = reference, "Loading WASM module");

        let payloads = self.resolver.resolve(reference).await?;
        let (module, digest) = self.compile_first(reference, &payloads)?;

        let instance = self
            .engine
            .instantiate(&module, reference, Arc::clone(&self.config_json))
            .await
            .map_err(|e| RegistryError::Instantiation {
                reference: reference.to_string(),
                message: format!("{e:#}"),
            })?;

        let handle = Arc::new(PluginHandle {
            reference: reference.to_string(),
            instance: Mutex::new(Some(instance)),
        });

        let mut plugins = self.plugins.lock().await;
        // A concurrent load of the same reference may have won the race;
        // keep the first instance so handle identity stays stable.
        if let Some(existing) = plugins.get(reference) {
            tracing::debug!(module = reference, "Concurrent load finished first");
            return Ok(Arc::clone(existing));
        }
        plugins.insert(reference.to_string(), Arc::clone(&handle));

        tracing::info!(module = reference, sha256 = %digest, "WASM module loaded");
        Ok(handle)
    }

    /// Pick the first payload that compiles as a WASM module. Bundles from a
    /// content address may carry auxiliary files; anything after the first
    /// loadable module is ignored with a note.
    fn compile_first(
        &self,
        reference: &str,
        payloads: &[Vec<u8>],
    ) -> Result<(wasmtime::Module, String), RegistryError> {
        let mut last_error = String::from("bundle contained no payloads");

        for (index, payload) in payloads.iter().enumerate() {
            match self.engine.compile(payload) {
                Ok(module) => {
                    let remaining = payloads.len() - index - 1;
                    if remaining > 0 {
                        tracing::debug!(
                            module = reference,
                            skipped = remaining,
                            "Ignoring additional bundle payloads"
                        );
                    }
                    let digest = hex::encode(Sha256::digest(payload));
                    return Ok((module, digest));
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    tracing::debug!(
                        module = reference,
                        payload = index,
                        error = %last_error,
                        "Payload did not compile"
                    );
                }
            }
        }

        Err(RegistryError::InvalidModule {
            reference: reference.to_string(),
            message: last_error,
        })
    }

    /// Whether the named function is exported by the loaded plugin.
    pub async fn function_exists(
        &self,
        reference: &str,
        function: &str,
    ) -> Result<bool, RegistryError> {
        let handle = self.handle(reference).await?;
        let mut guard = handle.instance.lock().await;
        match guard.as_mut() {
            Some(instance) => Ok(instance.function_exists(function)),
            None => Err(RegistryError::Shutdown),
        }
    }

    /// Invoke an exported function with a raw payload.
    ///
    /// The per-plugin mutex is acquired first (FIFO), so concurrent calls to
    /// one plugin are strictly serialized while calls to different plugins
    /// proceed in parallel. When the deadline elapses or the registry shuts
    /// down, the in-flight guest call is dropped — the fiber unwinds — and
    /// the caller sees a typed error.
    pub async fn call(
        &self,
        reference: &str,
        function: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<GuestOutcome, RegistryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Shutdown);
        }

        let handle = self.handle(reference).await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // Re-check after subscribing: a close that raced ahead of the
        // subscription would otherwise go unnoticed.
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Shutdown);
        }

        let mut guard = handle.instance.lock().await;
        let Some(instance) = guard.as_mut() else {
            return Err(RegistryError::Shutdown);
        };

        tracing::debug!(module = reference, function, "Invoking guest function");

        tokio::select! {
            outcome = instance.invoke(function, payload) => {
                outcome.map_err(|e| match e {
                    InvokeError::FunctionMissing => RegistryError::FunctionMissing {
                        reference: reference.to_string(),
                        function: function.to_string(),
                    },
                    InvokeError::Trap(message) => RegistryError::Call(message),
                })
            }
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(module = reference, function, "Guest call hit deadline, aborting");
                Err(RegistryError::Timeout)
            }
            _ = shutdown_rx.changed() => Err(RegistryError::Shutdown),
        }
    }

    /// Tear down every plugin. Safe to call more than once; late callers of
    /// [`call`](Self::call) observe [`RegistryError::Shutdown`]. In-flight
    /// guest calls are aborted so teardown is not blocked behind them.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<(String, Arc<PluginHandle>)> =
            self.plugins.lock().await.drain().collect();

        tracing::info!(count = handles.len(), "Closing WASM plugins");

        for (reference, handle) in handles {
            let mut guard = handle.instance.lock().await;
            match guard.take() {
                Some(instance) => {
                    drop(instance);
                    tracing::info!(module = %reference, "Plugin closed");
                }
                None => {
                    tracing::warn!(module = %reference, "Plugin was already closed");
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn loaded_references(&self) -> Vec<String> {
        self.plugins.lock().await.keys().cloned().collect()
    }

    async fn handle(&self, reference: &str) -> Result<Arc<PluginHandle>, RegistryError> {
        self.plugins
            .lock()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| RegistryError::ModuleNotLoaded(reference.to_string()))
    }
}
