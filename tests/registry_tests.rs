//! Tests for registry directory scanning and manifest validation.

mod common;

use cardano_up::{packages_from_dir, validate_packages};
use common::{FakeRuntime, test_config, write_manifest};
use tempfile::TempDir;

// =============================================================================
// Directory Scanning
// =============================================================================

#[test]
fn test_packages_from_dir_scans_yaml_manifests() {
    let temp = TempDir::new().unwrap();
    let registry = temp.path().join("registry");
    write_manifest(&registry, "packageA", "1.2.3", "");
    write_manifest(&registry, "packageA", "2.3.4", "");
    // .yml extension is accepted too
    std::fs::write(
        registry.join("packageA").join("packageB-3.4.5.yml"),
        "name: packageB\nversion: 3.4.5",
    )
    .unwrap();
    // Non-YAML files are ignored
    std::fs::write(
        registry.join("packageA").join("some.file"),
        "name: packageC\nversion: 4.5.6",
    )
    .unwrap();

    let packages = packages_from_dir(&registry).unwrap();
    let found: Vec<(String, String)> = packages
        .iter()
        .map(|p| (p.name.clone(), p.version.clone()))
        .collect();
    assert_eq!(
        found,
        vec![
            ("packageA".to_string(), "1.2.3".to_string()),
            ("packageA".to_string(), "2.3.4".to_string()),
            ("packageB".to_string(), "3.4.5".to_string()),
        ]
    );
}

#[test]
fn test_packages_from_dir_skips_empty_and_broken() {
    let temp = TempDir::new().unwrap();
    let registry = temp.path().join("registry");
    std::fs::create_dir_all(&registry).unwrap();
    // No name/version: skipped silently
    std::fs::write(registry.join("empty.yaml"), "description: nothing").unwrap();
    // Unparseable: logged and skipped
    std::fs::write(registry.join("broken.yaml"), "{{{not yaml").unwrap();
    write_manifest(&registry, "good", "1.0.0", "");

    let packages = packages_from_dir(&registry).unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].name, "good");
}

#[test]
fn test_packages_from_dir_skips_dot_dirs() {
    let temp = TempDir::new().unwrap();
    let registry = temp.path().join("registry");
    let hidden = registry.join(".git");
    std::fs::create_dir_all(&hidden).unwrap();
    std::fs::write(hidden.join("sneaky.yaml"), "name: sneaky\nversion: 1.0.0").unwrap();
    write_manifest(&registry, "good", "1.0.0", "");

    let packages = packages_from_dir(&registry).unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].name, "good");
}

#[test]
fn test_manifest_file_path_recorded() {
    let temp = TempDir::new().unwrap();
    let registry = temp.path().join("registry");
    write_manifest(&registry, "pkgA", "1.0.0", "");

    let packages = packages_from_dir(&registry).unwrap();
    assert!(packages[0]
        .file_path
        .ends_with("pkgA/pkgA-1.0.0.yaml"));
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_validate_accepts_good_manifests() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    let registry = temp.path().join("registry");
    write_manifest(
        &registry,
        "pkgA",
        "1.0.0",
        "installSteps:\n  - docker:\n      containerName: node\n      image: example/node:1\n",
    );

    validate_packages(&cfg, &registry).unwrap();
}

#[test]
fn test_validate_collects_problems() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    let registry = temp.path().join("registry");
    // Wrong file location for its name/version
    let dir = registry.join("misplaced");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("misplaced-1.0.yaml"), "name: other\nversion: 1.0.0").unwrap();
    // Docker step without an image
    write_manifest(
        &registry,
        "noimage",
        "1.0.0",
        "installSteps:\n  - docker:\n      containerName: node\n",
    );
    // Unparseable
    std::fs::write(registry.join("broken.yaml"), ":::").unwrap();

    let err = validate_packages(&cfg, &registry).unwrap_err();
    match err {
        cardano_up::Error::ValidationFailed { problems } => {
            assert_eq!(problems.len(), 3, "problems: {problems:?}");
        }
        other => panic!("expected ValidationFailed, got {other}"),
    }
}

#[test]
fn test_validate_rejects_bad_names_and_versions() {
    let temp = TempDir::new().unwrap();
    let runtime = FakeRuntime::new();
    let cfg = test_config(&temp, runtime);
    let registry = temp.path().join("registry");
    let dir = registry.join("bad_name!");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("bad_name!-x.y.yaml"),
        "name: \"bad_name!\"\nversion: x.y",
    )
    .unwrap();

    let err = validate_packages(&cfg, &registry).unwrap_err();
    assert!(matches!(
        err,
        cardano_up::Error::ValidationFailed { .. }
    ));
}
