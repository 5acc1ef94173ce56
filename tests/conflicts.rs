//! Duplicate detection between load jobs.

mod common;

use std::time::Duration;

use plugin_host::error::{Conflict, HostError};
use plugin_host::scripting::ScriptCompiler;
use plugin_host::ExtensionManager;
use tempfile::TempDir;

use common::MockToolchain;

#[tokio::test]
async fn test_same_content_in_two_files() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let text = r#"extension("Echo")"#;
    let a = common::write_plugin(&config, "a.rhai", text);
    let b = common::write_plugin(&config, "b.rhai", text);

    manager.submit(&a).unwrap().outcome().await.unwrap();
    let err = manager.submit(&b).unwrap().outcome().await.unwrap_err();
    match err {
        HostError::DuplicateExtension { existing, conflict } => {
            assert_eq!(existing, "a.rhai");
            assert!(matches!(conflict, Conflict::Checksum(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.len(), 1);
}

#[tokio::test]
async fn test_same_name_different_content() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let a = common::write_plugin(&config, "a.rhai", r#"extension("Echo").version("1")"#);
    let b = common::write_plugin(&config, "b.rhai", r#"extension("Echo").version("2")"#);

    manager.submit(&a).unwrap().outcome().await.unwrap();
    let err = manager.submit(&b).unwrap().outcome().await.unwrap_err();
    assert!(
        matches!(
            &err,
            HostError::DuplicateExtension { conflict: Conflict::Name(name), .. } if name == "Echo"
        ),
        "{err}"
    );
    assert_eq!(manager.len(), 1);
    assert_eq!(manager.get(0).unwrap().descriptor().version, "1");
}

#[tokio::test]
async fn test_concurrent_jobs_register_at_most_one() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 4);
    let toolchain = MockToolchain::new(Duration::from_millis(5));
    let manager =
        ExtensionManager::with_compiler(&config, ScriptCompiler::with_toolchain(toolchain))
            .unwrap();

    let a = common::write_plugin(&config, "a.rhai", "name Twin\n# a");
    let b = common::write_plugin(&config, "b.rhai", "name Twin\n# b");

    let ta = manager.submit(&a).unwrap();
    let tb = manager.submit(&b).unwrap();
    let (ra, rb) = tokio::join!(ta.outcome(), tb.outcome());

    let ok = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1, "{ra:?} {rb:?}");
    let failed = if ra.is_err() { ra } else { rb };
    assert!(matches!(
        failed,
        Err(HostError::DuplicateExtension {
            conflict: Conflict::Name(_),
            ..
        })
    ));
    assert_eq!(manager.len(), 1);
}

#[tokio::test]
async fn test_unloaded_name_can_load_again() {
    let dir = TempDir::new().unwrap();
    let config = common::config(dir.path(), 2);
    let manager = ExtensionManager::new(&config).unwrap();

    let a = common::write_plugin(&config, "a.rhai", r#"extension("Echo").version("1")"#);
    let b = common::write_plugin(&config, "b.rhai", r#"extension("Echo").version("2")"#);

    let id = manager.submit(&a).unwrap().outcome().await.unwrap();
    manager.unload_one(id).unwrap();
    let id = manager.submit(&b).unwrap().outcome().await.unwrap();
    assert_eq!(manager.get(id).unwrap().descriptor().version, "2");
}
