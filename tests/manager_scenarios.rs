//! End-to-end load scenarios against the Rhai toolchain.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use plugin_host::cache::{self, CacheStore};
use plugin_host::error::HostError;
use plugin_host::scripting::ScriptCompiler;
use plugin_host::{ExtensionManager, ExtensionState};
use tempfile::TempDir;

use common::MockToolchain;

const FOO: &str = r#"extension("Foo").version("1.0").author("dev")"#;

#[tokio::test]
async fn test_fresh_script_is_compiled_cached_and_registered() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();
    let file = common::write_plugin(&config, "foo.rhai", FOO);

    assert!(manager.load_one(&file));
    manager.wait_idle().await;

    let instance = manager.get(0).expect("id 0 registered");
    assert_eq!(instance.name(), "Foo");
    assert_eq!(instance.state(), ExtensionState::Loaded);
    assert_eq!(instance.file_name(), "foo.rhai");

    let meta = instance.provenance();
    let expected = config
        .paths
        .cache_dir()
        .join(format!("{}.cache", cache::checksum(FOO.as_bytes())));
    assert!(meta.fresh_compile);
    assert_eq!(meta.header, "PHC1/rhai-1");
    assert_eq!(meta.file, expected);
    assert!(expected.is_file());
    assert!(config.paths.data_dir().join("Foo").is_dir());
    assert!(manager.pending_files().is_empty());
}

#[tokio::test]
async fn test_second_host_run_reuses_cache() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let file = common::write_plugin(&config, "foo.rhai", FOO);

    let first = ExtensionManager::new(&config).unwrap();
    first.submit(&file).unwrap().outcome().await.unwrap();
    let descriptor = first.get(0).unwrap().descriptor().clone();
    first.shutdown().await;
    drop(first);

    let second = ExtensionManager::new(&config).unwrap();
    let id = second.submit(&file).unwrap().outcome().await.unwrap();
    let instance = second.get(id).unwrap();
    assert_eq!(id, 0);
    assert!(!instance.provenance().fresh_compile);
    assert_eq!(instance.descriptor(), &descriptor);
}

#[tokio::test]
async fn test_missing_library_fails_only_that_script() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();
    let bar = common::write_plugin(
        &config,
        "bar.rhai",
        "//@namespace ns1\n//@lib missing.rhai\nimport \"missing\" as m;\nextension(\"Bar\")\n",
    );
    let foo = common::write_plugin(&config, "foo.rhai", FOO);

    let bar_ticket = manager.submit(&bar).unwrap();
    let foo_ticket = manager.submit(&foo).unwrap();

    let err = bar_ticket.outcome().await.unwrap_err();
    assert!(matches!(err, HostError::Compile { .. }), "{err}");
    assert!(foo_ticket.outcome().await.is_ok());
    assert_eq!(manager.len(), 1);
    assert!(config.paths.lib_dir().join("ns1").is_dir());
}

#[tokio::test]
async fn test_enable_all_chains_onto_loading_jobs() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let (toolchain, gate) = MockToolchain::gated();
    let manager = ExtensionManager::with_compiler(
        &config,
        ScriptCompiler::with_toolchain(toolchain.clone()),
    )
    .unwrap();

    let early = common::write_plugin(&config, "early.rhai", "name Early");
    let slow = common::write_plugin(&config, "slow.rhai", "name Slow\nwait");

    let early_id = manager.submit(&early).unwrap().outcome().await.unwrap();
    let slow_ticket = manager.submit(&slow).unwrap();

    assert_eq!(manager.enable_all(), 1);
    assert_eq!(manager.get(early_id).unwrap().state(), ExtensionState::Enabled);

    gate.open();
    let slow_id = slow_ticket.outcome().await.unwrap();
    assert_eq!(manager.get(slow_id).unwrap().state(), ExtensionState::Enabled);
    assert_eq!(toolchain.hooks.load.load(Ordering::SeqCst), 2);
    assert_eq!(toolchain.hooks.enable.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disable_all_stops_chaining() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let toolchain = MockToolchain::new(Duration::ZERO);
    let manager =
        ExtensionManager::with_compiler(&config, ScriptCompiler::with_toolchain(toolchain))
            .unwrap();

    manager.enable_all();
    manager.disable_all();
    let file = common::write_plugin(&config, "late.rhai", "name Late");
    let id = manager.submit(&file).unwrap().outcome().await.unwrap();
    assert_eq!(manager.get(id).unwrap().state(), ExtensionState::Loaded);
}

#[tokio::test]
async fn test_lifecycle_through_manager() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 1);
    let toolchain = MockToolchain::new(Duration::ZERO);
    let manager = ExtensionManager::with_compiler(
        &config,
        ScriptCompiler::with_toolchain(toolchain.clone()),
    )
    .unwrap();
    let hooks = &toolchain.hooks;

    let file = common::write_plugin(&config, "cycle.rhai", "name Cycle");
    let id = manager.submit(&file).unwrap().outcome().await.unwrap();

    assert!(manager.enable_one(id).unwrap());
    assert!(!manager.enable_one(id).unwrap());
    assert_eq!(hooks.enable.load(Ordering::SeqCst), 1);

    assert!(manager.disable_one(id).unwrap());
    assert!(!manager.disable_one(id).unwrap());
    assert_eq!(hooks.disable.load(Ordering::SeqCst), 1);

    manager.enable_one(id).unwrap();
    manager.unload_one(id).unwrap();
    assert_eq!(hooks.disable.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.unload.load(Ordering::SeqCst), 1);
    assert!(manager.get(id).is_none());
    assert!(matches!(
        manager.unload_one(id),
        Err(HostError::UnknownExtension(_))
    ));
    assert!(matches!(
        manager.enable_one(42),
        Err(HostError::UnknownExtension(42))
    ));

    // Ids are never reused.
    let again = manager.submit(&file).unwrap().outcome().await.unwrap();
    assert_eq!(again, id + 1);
}

#[tokio::test]
async fn test_failures_surface_in_ticket() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let toolchain = MockToolchain::new(Duration::ZERO);
    let manager =
        ExtensionManager::with_compiler(&config, ScriptCompiler::with_toolchain(toolchain))
            .unwrap();

    let bad = common::write_plugin(&config, "bad.rhai", "name Bad\nsyntax error");
    let thrower = common::write_plugin(&config, "throw.rhai", "name Thrower\nthrow");

    let err = manager.submit(&bad).unwrap().outcome().await.unwrap_err();
    assert!(matches!(err, HostError::Compile { .. }));
    let err = manager.submit(&thrower).unwrap().outcome().await.unwrap_err();
    assert!(matches!(err, HostError::Evaluation(_)));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_script_must_yield_exactly_one_extension() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let none = common::write_plugin(&config, "none.rhai", "let answer = 42;\n");
    let two = common::write_plugin(
        &config,
        "two.rhai",
        "let first = extension(\"First\");\nlet second = extension(\"Second\");\n",
    );
    let declared = common::write_plugin(
        &config,
        "declared.rhai",
        "let label = \"x\";\nlet plugin = extension(\"Declared\");\n",
    );

    let err = manager.submit(&none).unwrap().outcome().await.unwrap_err();
    assert!(matches!(err, HostError::ExtensionNotFound), "{err}");
    let err = manager.submit(&two).unwrap().outcome().await.unwrap_err();
    assert!(
        matches!(err, HostError::AmbiguousExtension { count: 2 }),
        "{err}"
    );
    let id = manager.submit(&declared).unwrap().outcome().await.unwrap();
    assert_eq!(manager.get(id).unwrap().name(), "Declared");
    assert_eq!(manager.len(), 1);
}

#[tokio::test]
async fn test_submit_rejections() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let text = common::write_plugin(&config, "notes.txt", "hello");
    assert!(matches!(
        manager.submit(&text),
        Err(HostError::UnsupportedFile(_))
    ));
    assert!(matches!(
        manager.submit(config.paths.plugins_dir().join("absent.rhai")),
        Err(HostError::UnsupportedFile(_))
    ));

    let file = common::write_plugin(&config, "foo.rhai", FOO);
    let ticket = manager.submit(&file).unwrap();
    assert!(matches!(
        manager.submit(&file),
        Err(HostError::AlreadyLoaded(_))
    ));
    ticket.outcome().await.unwrap();
    assert!(!manager.load_one(&file));

    manager.shutdown().await;
    let other = common::write_plugin(&config, "other.rhai", r#"extension("Other")"#);
    assert!(matches!(manager.submit(&other), Err(HostError::ShuttingDown)));
}

#[tokio::test]
async fn test_discover_loads_recognised_files() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    common::write_plugin(&config, "a.rhai", r#"extension("A")"#);
    common::write_plugin(&config, "b.rhai", r#"extension("B")"#);
    common::write_plugin(&config, "readme.txt", "not a plugin");
    std::fs::create_dir_all(config.paths.plugins_dir().join("nested.rhai")).unwrap();

    assert_eq!(manager.discover_and_load_all().unwrap(), 2);
    manager.wait_idle().await;
    let names: Vec<_> = manager
        .instances()
        .iter()
        .map(|i| i.name().to_string())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"A".to_string()));
    assert!(names.contains(&"B".to_string()));
}

#[tokio::test]
async fn test_discover_requires_directory() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let plugins = config.paths.plugins_dir();
    std::fs::remove_dir_all(&plugins).unwrap();
    std::fs::write(&plugins, "file").unwrap();

    assert!(matches!(
        manager.discover_and_load_all(),
        Err(HostError::NotADirectory(_))
    ));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_precompiled_entry_loads_without_source() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let script = dir.path().join("outside.rhai");
    std::fs::write(&script, FOO).unwrap();
    let meta = manager.precompile(&script).await.unwrap();
    assert!(meta.fresh_compile);
    assert_eq!(meta.checksum, cache::checksum(FOO.as_bytes()));

    let again = manager.precompile(&script).await.unwrap();
    assert!(!again.fresh_compile);

    let copied = config
        .paths
        .plugins_dir()
        .join(format!("{}.cache", meta.checksum));
    std::fs::copy(&meta.file, &copied).unwrap();
    std::fs::remove_file(&script).unwrap();

    let id = manager.submit(&copied).unwrap().outcome().await.unwrap();
    let instance = manager.get(id).unwrap();
    assert_eq!(instance.name(), "Foo");
    assert!(!instance.provenance().fresh_compile);
    assert_eq!(instance.provenance().file, copied);
}

#[tokio::test]
async fn test_precompiled_entry_named_with_wrong_checksum() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let script = dir.path().join("outside.rhai");
    std::fs::write(&script, FOO).unwrap();
    let meta = manager.precompile(&script).await.unwrap();

    let renamed = config.paths.plugins_dir().join(format!("{}.cache", "0".repeat(32)));
    std::fs::copy(&meta.file, &renamed).unwrap();
    let err = manager.submit(&renamed).unwrap().outcome().await.unwrap_err();
    assert!(matches!(err, HostError::ChecksumMismatch { .. }), "{err}");

    // Entries with a free-form name are trusted.
    let custom = config.paths.plugins_dir().join("custom.cache");
    std::fs::copy(&meta.file, &custom).unwrap();
    assert!(manager.submit(&custom).unwrap().outcome().await.is_ok());
}

#[tokio::test]
async fn test_stale_cache_header_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();
    let file = common::write_plugin(&config, "foo.rhai", FOO);

    // Seed the cache slot with an entry from an older toolchain.
    let store = CacheStore::new(config.paths.cache_dir());
    let sum = cache::checksum(FOO.as_bytes());
    let artifact = plugin_host::scripting::CompiledArtifact {
        toolchain: "rhai-0".to_string(),
        payload: vec![1, 2, 3],
    };
    store
        .save(artifact, &store.locate(&sum), &file, &sum, "PHC1/rhai-0")
        .unwrap();

    let err = manager.submit(&file).unwrap().outcome().await.unwrap_err();
    match err {
        HostError::HeaderMismatch { found, expected, .. } => {
            assert_eq!(found, "PHC1/rhai-0");
            assert_eq!(expected, "PHC1/rhai-1");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(manager.is_empty());
    assert!(store.locate(&sum).is_file());
}
