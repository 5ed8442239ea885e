//! Wasmtime sandbox and host ABI.
//!
//! Plugins are core WASM modules. Each tool is an exported function with the
//! signature `() -> i32` (0 = success, non-zero = guest-reported error) that
//! exchanges data through host primitives imported from the `"wharf"` module:
//!
//! - `input_len() -> i32` — byte length of the invocation payload
//! - `input_read(ptr) -> i32` — copy the payload into guest memory
//! - `output_write(ptr, len) -> i32` — set the invocation output
//! - `config_len() -> i32` / `config_read(ptr) -> i32` — the manifest's
//!   opaque `llm_config` block, serialized as JSON
//! - `log(level, ptr, len)` — forwarded to the host's structured logs
//!
//! The host surfaces the guest's output string regardless of the return
//! code. WASI preview 1 is linked (wall clock included) with no filesystem
//! preopens and no host environment.
//!
//! The engine runs with async support and epoch interruption. A background
//! ticker bumps the epoch so long-running guest code yields to the scheduler
//! at every tick; deadlines are enforced by dropping the in-flight call,
//! which safely unwinds the guest fiber.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::p2::WasiCtxBuilder;

/// Interval of the epoch ticker thread; guest code yields at this cadence.
const EPOCH_TICK: Duration = Duration::from_millis(100);

/// Result of a guest invocation. `status` is the guest's raw return code;
/// `output` is whatever it wrote through `output_write`, surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestOutcome {
    pub status: i32,
    pub output: Vec<u8>,
}

#[derive(Debug, Error)]
pub(crate) enum InvokeError {
    #[error("function not exported")]
    FunctionMissing,
    #[error("{0}")]
    Trap(String),
}

/// Per-plugin store state backing the host primitives.
pub(crate) struct HostState {
    wasi: WasiP1Ctx,
    /// Plugin label used as the log target for guest `log` calls.
    label: String,
    config_json: Arc<str>,
    input: Vec<u8>,
    output: Option<Vec<u8>>,
}

/// Shared Wasmtime engine and linker.
///
/// Constructed once at startup and shared across every module load and
/// invocation; the direct endpoint and the RPC endpoint both go through the
/// same engine via the registry.
pub struct SandboxEngine {
    engine: Engine,
    linker: Linker<HostState>,
}

impl SandboxEngine {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);

        let engine = Engine::new(&config)?;

        // Epoch ticker. The weak handle lets the thread exit once the last
        // engine reference is gone.
        let weak = engine.weak();
        std::thread::Builder::new()
            .name("wharf-epoch".into())
            .spawn(move || loop {
                std::thread::sleep(EPOCH_TICK);
                let Some(engine) = weak.upgrade() else { break };
                engine.increment_epoch();
            })?;

        let mut linker: Linker<HostState> = Linker::new(&engine);
        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |state: &mut HostState| {
            &mut state.wasi
        })?;
        add_host_functions(&mut linker)?;

        tracing::debug!("SandboxEngine initialized (async + epoch interruption + WASI p1)");

        Ok(Self { engine, linker })
    }

    pub(crate) fn compile(&self, bytes: &[u8]) -> Result<Module, anyhow::Error> {
        Module::new(&self.engine, bytes)
    }

    pub(crate) async fn instantiate(
        &self,
        module: &Module,
        label: &str,
        config_json: Arc<str>,
    ) -> Result<PluginInstance, anyhow::Error> {
        // Deny-default WASI: no preopens, no host env. Clocks are available.
        let wasi = WasiCtxBuilder::new().build_p1();

        let state = HostState {
            wasi,
            label: label.to_string(),
            config_json,
            input: Vec::new(),
            output: None,
        };

        let mut store = Store::new(&self.engine, state);
        // Yield on every epoch tick; deadlines are enforced by the caller.
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        let instance = self.linker.instantiate_async(&mut store, module).await?;

        Ok(PluginInstance { store, instance })
    }
}

/// An instantiated plugin: its store (linear memory, WASI state, host-ABI
/// buffers) and instance. Exclusively owned by the registry behind a
/// per-plugin mutex; guest state persists across invocations.
pub(crate) struct PluginInstance {
    store: Store<HostState>,
    instance: Instance,
}

impl PluginInstance {
    pub(crate) fn function_exists(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    pub(crate) async fn invoke(
        &mut self,
        function: &str,
        payload: Vec<u8>,
    ) -> Result<GuestOutcome, InvokeError> {
        if self.instance.get_func(&mut self.store, function).is_none() {
            return Err(InvokeError::FunctionMissing);
        }

        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, function)
            .map_err(|e| InvokeError::Trap(format!("bad export signature: {e}")))?;

        {
            let state = self.store.data_mut();
            state.input = payload;
            state.output = None;
        }

        let status = func
            .call_async(&mut self.store, ())
            .await
            .map_err(|e| InvokeError::Trap(format!("{e:#}")))?;

        let output = self.store.data_mut().output.take().unwrap_or_default();
        Ok(GuestOutcome { status, output })
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

fn add_host_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap("wharf", "input_len", |caller: Caller<'_, HostState>| -> i32 {
        caller.data().input.len() as i32
    })?;

    linker.func_wrap(
        "wharf",
        "input_read",
        |mut caller: Caller<'_, HostState>, ptr: i32| -> i32 {
            if ptr < 0 {
                return -1;
            }
            let data = caller.data().input.clone();
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            match memory.write(&mut caller, ptr as usize, &data) {
                Ok(()) => data.len() as i32,
                Err(_) => -1,
            }
        },
    )?;

    linker.func_wrap(
        "wharf",
        "output_write",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
            if ptr < 0 || len < 0 {
                return -1;
            }
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            let mut buf = vec![0u8; len as usize];
            if memory.read(&caller, ptr as usize, &mut buf).is_err() {
                return -1;
            }
            caller.data_mut().output = Some(buf);
            0
        },
    )?;

    linker.func_wrap("wharf", "config_len", |caller: Caller<'_, HostState>| -> i32 {
        caller.data().config_json.len() as i32
    })?;

    linker.func_wrap(
        "wharf",
        "config_read",
        |mut caller: Caller<'_, HostState>, ptr: i32| -> i32 {
            if ptr < 0 {
                return -1;
            }
            let data = caller.data().config_json.as_bytes().to_vec();
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            match memory.write(&mut caller, ptr as usize, &data) {
                Ok(()) => data.len() as i32,
                Err(_) => -1,
            }
        },
    )?;

    linker.func_wrap(
        "wharf",
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
            if ptr < 0 || len < 0 {
                return;
            }
            let Some(memory) = guest_memory(&mut caller) else {
                return;
            };
            let mut buf = vec![0u8; len as usize];
            if memory.read(&caller, ptr as usize, &mut buf).is_err() {
                return;
            }
            let message = String::from_utf8_lossy(&buf);
            let plugin = caller.data().label.as_str();
            match level {
                0 => tracing::error!(plugin, "{message}"),
                1 => tracing::warn!(plugin, "{message}"),
                3 => tracing::debug!(plugin, "{message}"),
                _ => tracing::info!(plugin, "{message}"),
            }
        },
    )?;

    Ok(())
}
