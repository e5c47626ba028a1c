//! Persistent state store.
//!
//! Owns the per-user config directory and persists four YAML artifacts:
//!
//! ```text
//! contexts.yaml             context-name → context
//! active_context.yaml       scalar string
//! installed_packages.yaml   ordered installed-package records
//! port_registry.yaml        context → package → service → port map
//! ```
//!
//! Missing files load as empty; when no contexts exist a `default` context
//! is installed. Writes are atomic (temp file + rename) with mode `0600`
//! and a `0700` config dir, so a crash never leaves a partially-written
//! state file behind.
//!
//! ## Legacy Migration
//!
//! Older releases embedded a `portRegistry` mapping inside each context in
//! `contexts.yaml`. On first load with an empty standalone registry, that
//! mapping is lifted into `port_registry.yaml` and written back once.

use crate::constants::{
    ACTIVE_CONTEXT_FILENAME, CONTEXTS_FILENAME, DEFAULT_CONTEXT_NAME,
    INSTALLED_PACKAGES_FILENAME, PORT_REGISTRY_FILENAME, STATE_DIR_MODE, STATE_FILE_MODE,
};
use crate::context::Context;
use crate::error::Result;
use crate::package::InstalledPackage;
use crate::ports::PortRegistry;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// In-memory state, loaded from and saved to the config dir.
#[derive(Debug, Clone)]
pub struct State {
    config_dir: PathBuf,
    pub active_context: String,
    pub contexts: BTreeMap<String, Context>,
    pub installed_packages: Vec<InstalledPackage>,
    pub port_registry: PortRegistry,
}

impl State {
    /// Creates an empty state bound to a config dir. Call [`State::load`].
    #[must_use]
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            active_context: String::new(),
            contexts: BTreeMap::new(),
            installed_packages: Vec::new(),
            port_registry: PortRegistry::new(),
        }
    }

    /// Loads all state files, defaulting whatever is missing.
    pub fn load(&mut self) -> Result<()> {
        if let Some(contexts) = self.load_file(CONTEXTS_FILENAME)? {
            self.contexts = contexts;
        }
        if self.contexts.is_empty() {
            self.contexts.insert(
                DEFAULT_CONTEXT_NAME.to_string(),
                Context::default_context(),
            );
        }
        if let Some(active) = self.load_file(ACTIVE_CONTEXT_FILENAME)? {
            self.active_context = active;
        }
        if self.active_context.is_empty() {
            self.active_context = DEFAULT_CONTEXT_NAME.to_string();
        }
        if let Some(installed) = self.load_file(INSTALLED_PACKAGES_FILENAME)? {
            self.installed_packages = installed;
        }
        if let Some(registry) = self.load_file(PORT_REGISTRY_FILENAME)? {
            self.port_registry = registry;
        }
        if self.port_registry.is_empty() {
            self.migrate_legacy_port_registry()?;
        }
        Ok(())
    }

    /// Saves every state file atomically.
    pub fn save(&self) -> Result<()> {
        self.save_file(CONTEXTS_FILENAME, &self.contexts)?;
        self.save_file(ACTIVE_CONTEXT_FILENAME, &self.active_context)?;
        self.save_file(INSTALLED_PACKAGES_FILENAME, &self.installed_packages)?;
        self.save_file(PORT_REGISTRY_FILENAME, &self.port_registry)?;
        Ok(())
    }

    fn load_file<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let path = self.config_dir.join(filename);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            // Treat no file like an empty file
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_yaml::from_str(&content)?))
    }

    fn save_file<T: serde::Serialize>(&self, filename: &str, value: &T) -> Result<()> {
        ensure_state_dir(&self.config_dir)?;
        let path = self.config_dir.join(filename);
        let content = serde_yaml::to_string(value)?;
        // Write-then-rename keeps readers from ever seeing a torn file
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &content)?;
        set_file_mode(&tmp_path)?;
        std::fs::rename(&tmp_path, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp_path);
        })?;
        Ok(())
    }

    fn migrate_legacy_port_registry(&mut self) -> Result<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LegacyContext {
            #[serde(default)]
            port_registry: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
        }
        let path = self.config_dir.join(CONTEXTS_FILENAME);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let legacy: BTreeMap<String, LegacyContext> = serde_yaml::from_str(&content)?;
        let mut migrated = false;
        for (context_name, legacy_context) in legacy {
            if legacy_context.port_registry.is_empty() {
                continue;
            }
            self.port_registry
                .insert(context_name.clone(), legacy_context.port_registry);
            migrated = true;
            info!(
                "migrated legacy port registry for context {:?}",
                context_name
            );
        }
        if migrated {
            self.save_file(PORT_REGISTRY_FILENAME, &self.port_registry)?;
        } else {
            debug!("no legacy port registry entries to migrate");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn ensure_state_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if !dir.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(STATE_DIR_MODE)
            .create(dir)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_state_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(STATE_FILE_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}
