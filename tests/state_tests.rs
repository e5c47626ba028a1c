//! Tests for the state store: defaults, round-trips, atomic writes, and
//! the legacy port registry migration.

use cardano_up::{Context, DEFAULT_CONTEXT_NAME, InstalledPackage, Package, State};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn state_in(temp: &TempDir) -> State {
    State::new(temp.path().join("config"))
}

// =============================================================================
// Defaults
// =============================================================================

#[test]
fn test_load_missing_files_installs_default_context() {
    let temp = TempDir::new().unwrap();
    let mut state = state_in(&temp);
    state.load().unwrap();

    assert_eq!(state.active_context, DEFAULT_CONTEXT_NAME);
    assert!(state.contexts.contains_key(DEFAULT_CONTEXT_NAME));
    assert!(state.installed_packages.is_empty());
    assert!(state.port_registry.is_empty());
}

// =============================================================================
// Round-Trips
// =============================================================================

#[test]
fn test_save_and_reload_roundtrip() {
    let temp = TempDir::new().unwrap();
    let mut state = state_in(&temp);
    state.load().unwrap();

    state.contexts.insert(
        "testnet".to_string(),
        Context {
            description: "testing".to_string(),
            network: "preview".to_string(),
            network_magic: 2,
        },
    );
    state.active_context = "testnet".to_string();
    let pkg = Package {
        name: "pkgA".to_string(),
        version: "1.0.3".to_string(),
        ..Package::default()
    };
    state.installed_packages.push(InstalledPackage::new(
        pkg,
        "testnet".to_string(),
        "notes".to_string(),
        BTreeMap::from([("PKGA_URL".to_string(), "http://localhost".to_string())]),
        BTreeMap::from([("metrics".to_string(), true)]),
    ));
    state
        .port_registry
        .entry("testnet".to_string())
        .or_default()
        .entry("pkgA".to_string())
        .or_default()
        .insert(
            "node".to_string(),
            BTreeMap::from([("3001".to_string(), "40123".to_string())]),
        );
    state.save().unwrap();

    let mut reloaded = state_in(&temp);
    reloaded.load().unwrap();
    assert_eq!(reloaded.active_context, "testnet");
    assert_eq!(
        reloaded.contexts.get("testnet").unwrap().network_magic,
        2
    );
    assert_eq!(reloaded.installed_packages.len(), 1);
    let installed = &reloaded.installed_packages[0];
    assert_eq!(installed.package.name, "pkgA");
    assert_eq!(installed.options.get("metrics"), Some(&true));
    assert_eq!(
        reloaded.port_registry["testnet"]["pkgA"]["node"]["3001"],
        "40123"
    );
}

#[test]
fn test_save_leaves_no_temp_files() {
    let temp = TempDir::new().unwrap();
    let mut state = state_in(&temp);
    state.load().unwrap();
    state.save().unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("config"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

#[cfg(unix)]
#[test]
fn test_state_file_modes() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let mut state = state_in(&temp);
    state.load().unwrap();
    state.save().unwrap();

    let config_dir = temp.path().join("config");
    let dir_mode = std::fs::metadata(&config_dir).unwrap().permissions().mode();
    assert_eq!(dir_mode & 0o777, 0o700);
    let file_mode = std::fs::metadata(config_dir.join("contexts.yaml"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(file_mode & 0o777, 0o600);
}

#[test]
fn test_parse_error_is_fatal() {
    let temp = TempDir::new().unwrap();
    let config_dir = temp.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("contexts.yaml"), "{not yaml: [").unwrap();

    let mut state = state_in(&temp);
    assert!(state.load().is_err());
}

// =============================================================================
// Legacy Migration
// =============================================================================

#[test]
fn test_legacy_port_registry_migration() {
    let temp = TempDir::new().unwrap();
    let config_dir = temp.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    // Old layout: the port registry lived inside each context
    std::fs::write(
        config_dir.join("contexts.yaml"),
        r#"
default:
  description: Default context
  network: preprod
  networkMagic: 1
  portRegistry:
    pkgA:
      node:
        "3001": "40123"
"#,
    )
    .unwrap();

    let mut state = state_in(&temp);
    state.load().unwrap();

    assert_eq!(
        state.port_registry["default"]["pkgA"]["node"]["3001"],
        "40123"
    );
    // The standalone registry file is written as part of the migration
    assert!(config_dir.join("port_registry.yaml").exists());

    // A second load must not clobber anything
    let mut again = state_in(&temp);
    again.load().unwrap();
    assert_eq!(
        again.port_registry["default"]["pkgA"]["node"]["3001"],
        "40123"
    );
}

#[test]
fn test_no_migration_without_legacy_data() {
    let temp = TempDir::new().unwrap();
    let config_dir = temp.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("contexts.yaml"),
        "default:\n  description: Default context\n",
    )
    .unwrap();

    let mut state = state_in(&temp);
    state.load().unwrap();
    assert!(state.port_registry.is_empty());
}
