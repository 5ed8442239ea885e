//! End-to-end tests for the module host: resolution, loading, invocation,
//! per-plugin serialization, deadlines, and teardown.
//!
//! Fixtures are WAT modules compiled by wasmtime's built-in text-format
//! support, so the tests need no external WASM toolchain.

use std::sync::Arc;
use std::time::Duration;

use wharf_host::manifest::{IpfsConfig, LassieNet};
use wharf_host::{ModuleResolver, PluginRegistry, RegistryError, SandboxEngine};

const SAY_HELLO_WAT: &str = r#"
(module
  (import "wharf" "input_read" (func $input_read (param i32) (result i32)))
  (import "wharf" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "Hello, ")
  (data (i32.const 16) "!")
  (func (export "say_hello") (result i32)
    (local $len i32)
    (local.set $len (call $input_read (i32.const 4096)))
    (memory.copy (i32.const 2048) (i32.const 0) (i32.const 7))
    (memory.copy (i32.const 2055) (i32.const 4096) (local.get $len))
    (memory.copy
      (i32.add (i32.const 2055) (local.get $len))
      (i32.const 16)
      (i32.const 1))
    (drop (call $output_write
      (i32.const 2048)
      (i32.add (local.get $len) (i32.const 8))))
    (i32.const 0)))
"#;

/// Scans the payload for a "signature" key; non-zero status plus a JSON
/// verdict when it is absent.
const VALIDATE_WAT: &str = r#"
(module
  (import "wharf" "input_read" (func $input_read (param i32) (result i32)))
  (import "wharf" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "\22signature\22")
  (data (i32.const 32) "{\"valid\": true}")
  (data (i32.const 64) "{\"valid\": false, \"error\": \"missing 'signature' key\"}")
  (func $matches_at (param $pos i32) (result i32)
    (local $j i32)
    (block $fail
      (loop $cmp
        (br_if $fail
          (i32.ne
            (i32.load8_u (i32.add (local.get $pos) (local.get $j)))
            (i32.load8_u (local.get $j))))
        (local.set $j (i32.add (local.get $j) (i32.const 1)))
        (br_if $cmp (i32.lt_s (local.get $j) (i32.const 11))))
      (return (i32.const 1)))
    (i32.const 0))
  (func (export "validate_data") (result i32)
    (local $len i32)
    (local $i i32)
    (local.set $len (call $input_read (i32.const 8192)))
    (block $no_match
      (br_if $no_match (i32.lt_s (local.get $len) (i32.const 11)))
      (loop $scan
        (if (call $matches_at (i32.add (i32.const 8192) (local.get $i)))
          (then
            (drop (call $output_write (i32.const 32) (i32.const 15)))
            (return (i32.const 0))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br_if $scan
          (i32.le_s
            (local.get $i)
            (i32.sub (local.get $len) (i32.const 11))))))
    (drop (call $output_write (i32.const 64) (i32.const 52)))
    (i32.const 1)))
"#;

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

/// Serialization probe: bumps an instance-global counter and returns it.
/// Distinct outputs across concurrent calls prove mutual exclusion.
const BUMP_WAT: &str = r#"
(module
  (import "wharf" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (global $n (mut i32) (i32.const 0))
  (func (export "bump") (result i32)
    (global.set $n (i32.add (global.get $n) (i32.const 1)))
    (i32.store (i32.const 0) (global.get $n))
    (drop (call $output_write (i32.const 0) (i32.const 4)))
    (i32.const 0)))
"#;

/// `spin` never returns; `echo` proves the instance survives an abort.
const SPIN_WAT: &str = r#"
(module
  (import "wharf" "input_read" (func $input_read (param i32) (result i32)))
  (import "wharf" "output_write" (func $output_write (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "spin") (result i32)
    (loop $forever (br $forever))
    (i32.const 0))
  (func (export "echo") (result i32)
    (local $len i32)
    (local.set $len (call $input_read (i32.const 1024)))
    (drop (call $output_write (i32.const 1024) (local.get $len)))
    (i32.const 0)))
"#;

const DEADLINE: Duration = Duration::from_secs(10);

fn local_registry() -> PluginRegistry {
    PluginRegistry::new(
        SandboxEngine::new().unwrap(),
        ModuleResolver::local_only(),
        "{}".into(),
    )
}

fn write_fixture(dir: &tempfile::TempDir, name: &str, wat: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, wat).unwrap();
    format!("file://{}", path.display())
}

#[tokio::test]
async fn say_hello_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write_fixture(&dir, "say_hello.wat", SAY_HELLO_WAT);

    let registry = local_registry();
    registry.load(&reference).await.unwrap();

    let outcome = registry
        .call(&reference, "say_hello", b"World".to_vec(), DEADLINE)
        .await
        .unwrap();
    assert_eq!(outcome.status, 0);
    assert_eq!(outcome.output, b"Hello, World!");
}

#[tokio::test]
async fn validation_verdicts_follow_the_payload() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write_fixture(&dir, "validate.wat", VALIDATE_WAT);

    let registry = local_registry();
    registry.load(&reference).await.unwrap();

    let ok = registry
        .call(
            &reference,
            "validate_data",
            b"{\"signature\":\"abc\"}".to_vec(),
            DEADLINE,
        )
        .await
        .unwrap();
    assert_eq!(ok.status, 0);
    assert_eq!(ok.output, br#"{"valid": true}"#);

    // Non-zero status, but the output is still surfaced.
    let failed = registry
        .call(&reference, "validate_data", b"{\"other\":1}".to_vec(), DEADLINE)
        .await
        .unwrap();
    assert_eq!(failed.status, 1);
    assert_eq!(
        failed.output,
        br#"{"valid": false, "error": "missing 'signature' key"}"#
    );
}

#[tokio::test]
async fn load_is_idempotent_with_stable_identity() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write_fixture(&dir, "echo.wat", ECHO_WAT);

    let registry = local_registry();
    let first = registry.load(&reference).await.unwrap();
    let second = registry.load(&reference).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.loaded_references().await.len(), 1);
}

#[tokio::test]
async fn references_are_compared_textually() {
    // The same file under two spellings gets two plugin instances.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.wat");
    std::fs::write(&path, ECHO_WAT).unwrap();

    let with_scheme = format!("file://{}", path.display());
    let bare = path.display().to_string();

    let registry = local_registry();
    let a = registry.load(&with_scheme).await.unwrap();
    let b = registry.load(&bare).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(registry.loaded_references().await.len(), 2);
}

#[tokio::test]
async fn missing_function_is_typed() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write_fixture(&dir, "echo.wat", ECHO_WAT);

    let registry = local_registry();
    registry.load(&reference).await.unwrap();

    assert!(registry.function_exists(&reference, "echo").await.unwrap());
    assert!(!registry.function_exists(&reference, "nope").await.unwrap());

    let err = registry
        .call(&reference, "nope", Vec::new(), DEADLINE)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::FunctionMissing { .. }));
}

#[tokio::test]
async fn unloaded_module_is_typed() {
    let registry = local_registry();
    let err = registry
        .call("file:///never/loaded.wasm", "echo", Vec::new(), DEADLINE)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ModuleNotLoaded(_)));
}

#[tokio::test]
async fn invalid_module_bytes_are_typed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.wasm");
    std::fs::write(&path, b"not wasm at all").unwrap();

    let registry = local_registry();
    let err = registry
        .load(&format!("file://{}", path.display()))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidModule { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_to_one_plugin_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write_fixture(&dir, "bump.wat", BUMP_WAT);

    let registry = Arc::new(local_registry());
    registry.load(&reference).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let registry = Arc::clone(&registry);
        let reference = reference.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .call(&reference, "bump", Vec::new(), DEADLINE)
                .await
                .unwrap()
        }));
    }

    let mut seen = std::collections::BTreeSet::new();
    for task in tasks {
        let outcome = task.await.unwrap();
        let value = u32::from_le_bytes(outcome.output.try_into().unwrap());
        assert!(seen.insert(value), "duplicate counter value {value}");
    }
    // Strict serialization: every increment observed exactly once.
    assert_eq!(seen.iter().copied().collect::<Vec<_>>(), (1..=64).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_plugins_run_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let ref_a = write_fixture(&dir, "bump_a.wat", BUMP_WAT);
    let ref_b = write_fixture(&dir, "bump_b.wat", BUMP_WAT);

    let registry = Arc::new(local_registry());
    registry.load(&ref_a).await.unwrap();
    registry.load(&ref_b).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..64 {
        let registry = Arc::clone(&registry);
        let reference = if i % 2 == 0 { ref_a.clone() } else { ref_b.clone() };
        tasks.push(tokio::spawn(async move {
            registry
                .call(&reference, "bump", Vec::new(), DEADLINE)
                .await
                .unwrap()
        }));
    }

    let mut max_a = 0u32;
    let mut max_b = 0u32;
    for (i, task) in tasks.into_iter().enumerate() {
        let outcome = task.await.unwrap();
        let value = u32::from_le_bytes(outcome.output.try_into().unwrap());
        if i % 2 == 0 {
            max_a = max_a.max(value);
        } else {
            max_b = max_b.max(value);
        }
    }
    // Each plugin saw exactly its own 32 serialized increments.
    assert_eq!(max_a, 32);
    assert_eq!(max_b, 32);
}

#[tokio::test]
async fn deadline_aborts_the_guest_and_the_plugin_survives() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write_fixture(&dir, "spin.wat", SPIN_WAT);

    let registry = local_registry();
    registry.load(&reference).await.unwrap();

    let err = registry
        .call(&reference, "spin", Vec::new(), Duration::from_millis(250))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Timeout));

    // The aborted call released the plugin; it remains usable.
    let outcome = registry
        .call(&reference, "echo", b"still alive".to_vec(), DEADLINE)
        .await
        .unwrap();
    assert_eq!(outcome.output, b"still alive");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_refuses_new_calls_and_aborts_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let reference = write_fixture(&dir, "spin.wat", SPIN_WAT);

    let registry = Arc::new(local_registry());
    registry.load(&reference).await.unwrap();

    let in_flight = {
        let registry = Arc::clone(&registry);
        let reference = reference.clone();
        tokio::spawn(async move {
            registry
                .call(&reference, "spin", Vec::new(), Duration::from_secs(60))
                .await
        })
    };

    // Let the spinning call take the plugin mutex before closing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    registry.close().await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, RegistryError::Shutdown));

    let err = registry
        .call(&reference, "echo", Vec::new(), DEADLINE)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Shutdown));

    let err = registry.load(&reference).await.unwrap_err();
    assert!(matches!(err, RegistryError::Shutdown));

    // Idempotent.
    registry.close().await;
    assert!(registry.is_closed());
}

mod gateway {
    //! Content-addressed load path against an in-process gateway.

    use super::*;
    use axum::extract::Path;
    use axum::routing::get;

    async fn serve_bundle(bundle: Vec<u8>) -> std::net::SocketAddr {
        let app = axum::Router::new().route(
            "/ipfs/{cid}",
            get(move |Path(cid): Path<String>| {
                let bundle = bundle.clone();
                async move {
                    if cid == "bafyecho" {
                        Ok(bundle)
                    } else {
                        Err(axum::http::StatusCode::NOT_FOUND)
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn tar_bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for &(path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn fetch_registry(addr: std::net::SocketAddr) -> PluginRegistry {
        let config = IpfsConfig {
            enable: true,
            lassie_net: LassieNet {
                scheme: "http".into(),
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            cids: vec![],
        };
        PluginRegistry::new(
            SandboxEngine::new().unwrap(),
            ModuleResolver::from_config(&config),
            "{}".into(),
        )
    }

    #[tokio::test]
    async fn loads_module_from_content_address() {
        // A README rides along in the bundle; the loader picks the module.
        let bundle = tar_bundle(&[
            ("README.txt", b"payload docs".as_slice()),
            ("echo.wasm", ECHO_WAT.as_bytes()),
        ]);
        let addr = serve_bundle(bundle).await;
        let registry = fetch_registry(addr);

        registry.load("IPFS://bafyecho").await.unwrap();
        let outcome = registry
            .call("IPFS://bafyecho", "echo", b"over the wire".to_vec(), DEADLINE)
            .await
            .unwrap();
        assert_eq!(outcome.output, b"over the wire");
    }

    #[tokio::test]
    async fn bare_reference_falls_back_to_fetch() {
        let bundle = tar_bundle(&[("echo.wasm", ECHO_WAT.as_bytes())]);
        let addr = serve_bundle(bundle).await;
        let registry = fetch_registry(addr);

        // Not a file on disk, so the resolver tries the gateway.
        registry.load("bafyecho").await.unwrap();
        assert_eq!(registry.loaded_references().await, vec!["bafyecho"]);
    }

    #[tokio::test]
    async fn gateway_miss_is_a_fetch_error() {
        let bundle = tar_bundle(&[("echo.wasm", ECHO_WAT.as_bytes())]);
        let addr = serve_bundle(bundle).await;
        let registry = fetch_registry(addr);

        let err = registry.load("IPFS://unknown-cid").await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Resolve(wharf_host::ResolveError::Fetch(_))
        ));
    }
}
