//! End-to-end tests for nox-core against a real host.
//!
//! These tests require:
//! - Linux with /dev/kvm access and libvirtd (`default` network active)
//! - `qemu-img` and `genisoimage` on PATH
//! - Network access to the image catalog
//!
//! Run with: `cargo test -p nox-core -- --ignored --test-threads=1`

use nox_core::{
    ConfigStore, CreateRequest, InstanceState, NoxManager, Paths, RestoreRequest,
};

fn manager(dir: &std::path::Path) -> NoxManager {
    let paths = Paths::new(dir.join(".nox"));
    let store = ConfigStore::load(paths.config_file()).expect("Failed to load config");
    NoxManager::open(paths, store.config().clone()).expect("Failed to open manager")
}

/// create -> address -> stop -> start -> delete
#[tokio::test]
#[ignore = "requires Linux + KVM + libvirt"]
async fn test_instance_lifecycle() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let nox = manager(dir.path());

    let request = CreateRequest {
        cpus: Some(1.0),
        ram: Some(1024.0),
        disk: Some(10.0),
        ..CreateRequest::new("nox-it-life")
    };
    let (record, password) = nox.orchestrator().create(request).await.expect("Failed to create");
    assert_eq!(record.state, InstanceState::Running);
    assert!(!password.expose().is_empty());

    let ip = nox
        .locator()
        .wait_for_address(&record)
        .await
        .expect("No address");
    println!("nox-it-life is at {ip}");

    let stopped = nox.orchestrator().stop("nox-it-life").await.expect("Failed to stop");
    assert_eq!(stopped.state, InstanceState::Stopped);
    let started = nox.orchestrator().start("nox-it-life").await.expect("Failed to start");
    assert_eq!(started.state, InstanceState::Running);

    nox.orchestrator().delete("nox-it-life").await.expect("Failed to delete");
    assert!(nox.orchestrator().registry().get("nox-it-life").unwrap().is_none());
}

/// Live backup, then restore as a copy next to the original.
#[tokio::test]
#[ignore = "requires Linux + KVM + libvirt"]
async fn test_backup_and_restore_copy() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let nox = manager(dir.path());

    let request = CreateRequest {
        disk: Some(10.0),
        ..CreateRequest::new("nox-it-src")
    };
    nox.orchestrator().create(request).await.expect("Failed to create");

    let outcome = nox.backups().backup("nox-it-src").await.expect("Failed to back up");
    assert!(outcome.warning.is_none());

    let restored = nox
        .backups()
        .restore(RestoreRequest {
            reference: outcome.backup.id(),
            name: Some("nox-it-copy".into()),
            force: false,
            start: false,
        })
        .await
        .expect("Failed to restore");
    assert_eq!(restored.record.state, InstanceState::Stopped);
    assert!(restored.password.is_some());

    nox.orchestrator().delete("nox-it-copy").await.expect("Failed to delete copy");
    nox.orchestrator().delete("nox-it-src").await.expect("Failed to delete source");
}
