//! End-to-end tests for the package manager façade, driven against the
//! in-memory fake runtime.

mod common;

use cardano_up::{Config, Context, Error, PackageManager, State};
use common::{FakeRuntime, test_config, write_manifest};
use std::sync::Arc;
use tempfile::TempDir;

async fn manager(cfg: &Config) -> PackageManager {
    PackageManager::new(cfg.clone()).await.unwrap()
}

/// Points the active context at the preprod network so installs work.
async fn with_network(cfg: &Config) -> PackageManager {
    let mut pm = manager(cfg).await;
    let (name, mut context) = pm.active_context();
    context.network = "preprod".to_string();
    pm.update_context(&name, context).unwrap();
    pm
}

fn registry_dir(cfg: &Config) -> std::path::PathBuf {
    cfg.registry_dir.clone().unwrap()
}

// =============================================================================
// Install
// =============================================================================

#[tokio::test]
async fn test_fresh_install_default_context() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime.clone());
    let registry = registry_dir(&cfg);
    let body = "postInstallNotes: \"Installed {{ .Package.ShortName }}\"\n";
    write_manifest(&registry, "pkgA", "1.0.2", body);
    write_manifest(&registry, "pkgA", "1.0.3", body);

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();

    let installed = pm.installed_packages();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].package.name, "pkgA");
    assert_eq!(installed[0].package.version, "1.0.3");
    assert_eq!(installed[0].context, "default");
    assert_eq!(installed[0].post_install_notes, "Installed pkgA");

    // State survives a reload
    let pm2 = manager(&cfg).await;
    assert_eq!(pm2.installed_packages().len(), 1);
}

#[tokio::test]
async fn test_install_requires_network() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    write_manifest(&registry_dir(&cfg), "pkgA", "1.0.3", "");

    let mut pm = manager(&cfg).await;
    let err = pm.install(&["pkgA".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::ContextInstallNoNetwork));
}

#[tokio::test]
async fn test_install_with_dependency() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime.clone());
    let registry = registry_dir(&cfg);
    write_manifest(&registry, "pkgA", "1.0.2", "");
    write_manifest(&registry, "pkgA", "1.0.3", "");
    write_manifest(&registry, "pkgA", "2.1.3", "");
    write_manifest(
        &registry,
        "pkgB",
        "0.1.0",
        "dependencies:\n  - pkgA < 2.0.0, >= 1.0.2\n",
    );

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgB".to_string()]).await.unwrap();

    let mut installed: Vec<(String, String)> = pm
        .installed_packages()
        .into_iter()
        .map(|p| (p.package.name, p.package.version))
        .collect();
    installed.sort();
    assert_eq!(
        installed,
        vec![
            ("pkgA".to_string(), "1.0.3".to_string()),
            ("pkgB".to_string(), "0.1.0".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_install_twice_rejected() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    write_manifest(&registry_dir(&cfg), "pkgA", "1.0.3", "");

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();
    let err = pm.install(&["pkgA".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::PackageAlreadyInstalled(_)));
}

#[tokio::test]
async fn test_available_packages_filtered_by_tags() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let mut cfg = test_config(&temp, runtime);
    cfg.required_package_tags = vec!["docker".to_string(), "linux".to_string()];
    let registry = registry_dir(&cfg);
    write_manifest(&registry, "both", "1.0.0", "tags:\n  - docker\n  - linux\n");
    write_manifest(&registry, "partial", "1.0.0", "tags:\n  - docker\n");
    write_manifest(&registry, "untagged", "1.0.0", "");

    let pm = manager(&cfg).await;
    let available: Vec<String> = pm
        .available_packages()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(available, vec!["both".to_string()]);
}

// =============================================================================
// Uninstall
// =============================================================================

#[tokio::test]
async fn test_install_then_uninstall_restores_state() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime.clone());
    write_manifest(
        &registry_dir(&cfg),
        "pkgA",
        "1.0.3",
        "installSteps:\n  - docker:\n      containerName: node\n      image: example/node:1\n      ports:\n        - \"3001\"\n",
    );

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();
    assert_eq!(runtime.container_names().len(), 1);

    pm.uninstall("pkgA", false, false).await.unwrap();

    assert!(pm.installed_packages().is_empty());
    assert!(runtime.container_names().is_empty());
    let mut state = State::new(cfg.config_dir.clone());
    state.load().unwrap();
    assert!(state.installed_packages.is_empty());
    assert!(state.port_registry.is_empty());
}

#[tokio::test]
async fn test_uninstall_missing_package() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);

    let mut pm = manager(&cfg).await;
    let err = pm.uninstall("ghost", false, false).await.unwrap_err();
    assert!(matches!(err, Error::PackageNotInstalled { .. }));
}

#[tokio::test]
async fn test_uninstall_would_break_deps() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    let registry = registry_dir(&cfg);
    write_manifest(&registry, "pkgA", "1.0.3", "");
    write_manifest(
        &registry,
        "pkgB",
        "0.1.0",
        "dependencies:\n  - pkgA < 2.0.0, >= 1.0.2\n",
    );

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgB".to_string()]).await.unwrap();

    let err = pm.uninstall("pkgA", false, false).await.unwrap_err();
    assert!(matches!(err, Error::UninstallWouldBreakDeps { .. }));

    // Force bypasses the dependency check
    pm.uninstall("pkgA", false, true).await.unwrap();
    assert_eq!(pm.installed_packages().len(), 1);
}

// =============================================================================
// Upgrade
// =============================================================================

#[tokio::test]
async fn test_upgrade_same_version_rejected() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    write_manifest(&registry_dir(&cfg), "pkgA", "1.0.3", "");

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();
    let err = pm.upgrade(&["pkgA".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::NoPackageAvailableForUpgrade(_)));
}

#[tokio::test]
async fn test_upgrade_preserves_host_ports() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime.clone());
    let registry = registry_dir(&cfg);
    let body = "installSteps:\n  - docker:\n      containerName: node\n      image: \"example/node:{{ .Package.Version }}\"\n      ports:\n        - \"3001\"\n";
    write_manifest(&registry, "pkgA", "1.0.3", body);

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();

    let mut state = State::new(cfg.config_dir.clone());
    state.load().unwrap();
    let allocated = state.port_registry["default"]["pkgA"]["node"]["3001"].clone();

    // A newer version appears in the registry
    write_manifest(&registry, "pkgA", "1.0.4", body);
    let mut pm = with_network(&cfg).await;
    pm.upgrade(&["pkgA".to_string()]).await.unwrap();

    let installed = pm.installed_packages();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].package.version, "1.0.4");
    // The replacement container keeps the previously allocated host port
    let container = runtime.container("pkgA-1.0.4-default-node").unwrap();
    assert_eq!(
        container.service.ports,
        vec![format!("{allocated}:3001")]
    );
    let mut state = State::new(cfg.config_dir.clone());
    state.load().unwrap();
    assert_eq!(
        state.port_registry["default"]["pkgA"]["node"]["3001"],
        allocated
    );
}

// =============================================================================
// Services
// =============================================================================

#[tokio::test]
async fn test_up_and_down() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime.clone());
    write_manifest(
        &registry_dir(&cfg),
        "pkgA",
        "1.0.3",
        "installSteps:\n  - docker:\n      containerName: node\n      image: example/node:1\n",
    );

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();
    let name = "pkgA-1.0.3-default-node";
    assert!(runtime.container(name).unwrap().running);

    pm.down().await.unwrap();
    assert!(!runtime.container(name).unwrap().running);

    pm.up().await.unwrap();
    assert!(runtime.container(name).unwrap().running);
}

#[tokio::test]
async fn test_logs_requires_services() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    write_manifest(&registry_dir(&cfg), "pkgA", "1.0.3", "");

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();
    let err = pm.logs("pkgA", false, None).await.unwrap_err();
    assert!(matches!(err, Error::NoServicesFound(_)));
}

#[tokio::test]
async fn test_info_reports_status_and_ports() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    write_manifest(
        &registry_dir(&cfg),
        "pkgA",
        "1.0.3",
        "installSteps:\n  - docker:\n      containerName: node\n      image: example/node:1\n      ports:\n        - \"3001\"\n",
    );

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();

    let info = pm.info(&["pkgA".to_string()]).await.unwrap();
    assert!(info.contains("Name: pkgA"));
    assert!(info.contains("Version: 1.0.3"));
    assert!(info.contains("RUNNING"));
    assert!(info.contains("(host) => 3001  (container)"));
}

// =============================================================================
// Contexts
// =============================================================================

#[tokio::test]
async fn test_context_lifecycle() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);

    let mut pm = manager(&cfg).await;
    pm.add_context(
        "testnet",
        Context {
            description: "preview playground".to_string(),
            network: "preview".to_string(),
            network_magic: 0,
        },
    )
    .unwrap();
    // The magic is resolved from the network name
    assert_eq!(pm.contexts()["testnet"].network_magic, 2);

    let err = pm
        .add_context("testnet", Context::default())
        .unwrap_err();
    assert!(matches!(err, Error::ContextAlreadyExists));

    pm.set_active_context("testnet").await.unwrap();
    assert_eq!(pm.active_context().0, "testnet");

    let err = pm.delete_context("testnet").unwrap_err();
    assert!(matches!(err, Error::ContextNoDeleteActive));

    pm.set_active_context("default").await.unwrap();
    pm.delete_context("testnet").unwrap();
    assert!(!pm.contexts().contains_key("testnet"));

    let err = pm.delete_context("ghost").unwrap_err();
    assert!(matches!(err, Error::ContextNotExist));
}

#[tokio::test]
async fn test_context_network_immutable() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);

    let mut pm = with_network(&cfg).await;
    let (name, mut context) = pm.active_context();
    context.network = "mainnet".to_string();
    let err = pm.update_context(&name, context).unwrap_err();
    assert!(matches!(err, Error::ContextNoChangeNetwork));
}

#[tokio::test]
async fn test_context_unknown_network_rejected() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);

    let mut pm = manager(&cfg).await;
    let (name, mut context) = pm.active_context();
    context.network = "bogusnet".to_string();
    let err = pm.update_context(&name, context).unwrap_err();
    assert!(matches!(err, Error::UnknownNetwork(_)));
}

#[tokio::test]
async fn test_packages_isolated_per_context() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    write_manifest(&registry_dir(&cfg), "pkgA", "1.0.3", "");

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string()]).await.unwrap();

    pm.add_context(
        "other",
        Context {
            network: "preview".to_string(),
            ..Context::default()
        },
    )
    .unwrap();
    pm.set_active_context("other").await.unwrap();
    assert!(pm.installed_packages().is_empty());
    assert_eq!(pm.installed_packages_all_contexts().len(), 1);

    // The same package can be installed into the second context
    pm.install(&["pkgA".to_string()]).await.unwrap();
    assert_eq!(pm.installed_packages().len(), 1);
    assert_eq!(pm.installed_packages_all_contexts().len(), 2);
}

#[tokio::test]
async fn test_context_env_unions_outputs() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    let registry = registry_dir(&cfg);
    write_manifest(
        &registry,
        "pkgA",
        "1.0.0",
        "outputs:\n  - name: url\n    value: \"http://localhost\"\n",
    );
    write_manifest(
        &registry,
        "pkgB",
        "1.0.0",
        "outputs:\n  - name: socket\n    value: \"/tmp/node.socket\"\n",
    );

    let mut pm = with_network(&cfg).await;
    pm.install(&["pkgA".to_string(), "pkgB".to_string()])
        .await
        .unwrap();

    let env = pm.context_env();
    assert_eq!(env["PKGA_URL"], "http://localhost");
    assert_eq!(env["PKGB_SOCKET"], "/tmp/node.socket");
}
