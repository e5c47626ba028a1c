//! Package manager façade.
//!
//! `PackageManager` wires the state store, registry, resolver, and package
//! engine together behind the operations the CLI exposes: install, upgrade,
//! uninstall, service up/down, info, logs, and context management.
//!
//! State is persisted after each package's install/uninstall completes, so
//! a crash mid-way through a multi-package operation leaves the finished
//! packages recorded and the rest untouched.

use crate::config::Config;
use crate::constants::REGISTRY_CACHE_DIR;
use crate::context::{Context, network_magic};
use crate::error::{Error, Result};
use crate::package::{InstalledPackage, Package};
use crate::ports::split_host_container;
use crate::registry;
use crate::resolver::Resolver;
use crate::state::State;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Top-level API over contexts, packages, and services.
pub struct PackageManager {
    config: Config,
    state: State,
    available_packages: Vec<Package>,
}

impl PackageManager {
    /// Builds a manager: loads state, preloads the registry (unless
    /// disabled), and binds the context template vars.
    pub async fn new(config: Config) -> Result<Self> {
        debug!("initializing package manager");
        let mut state = State::new(config.config_dir.clone());
        state.load()?;
        let mut manager = Self {
            config,
            state,
            available_packages: Vec::new(),
        };
        if manager.config.registry_preload {
            manager.available_packages = registry::available_packages(&manager.config).await?;
        }
        manager.init_template();
        Ok(manager)
    }

    /// Builds a manager from the default per-user configuration.
    pub async fn new_default() -> Result<Self> {
        Self::new(Config::default_config()?).await
    }

    /// The effective config (with context template vars bound).
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn init_template(&mut self) {
        let (name, context) = self.active_context();
        let env = self.context_env();
        self.config.template = self.config.template.with_vars(json!({
            "Context": {
                "Name": name,
                "Network": context.network,
                "NetworkMagic": context.network_magic,
            },
            "Env": env,
        }));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Available packages carrying every required tag.
    #[must_use]
    pub fn available_packages(&self) -> Vec<Package> {
        self.available_packages
            .iter()
            .filter(|pkg| pkg.has_tags(&self.config.required_package_tags))
            .cloned()
            .collect()
    }

    /// Installed packages in the active context.
    #[must_use]
    pub fn installed_packages(&self) -> Vec<InstalledPackage> {
        self.state
            .installed_packages
            .iter()
            .filter(|pkg| pkg.context == self.state.active_context)
            .cloned()
            .collect()
    }

    /// Installed packages across every context.
    #[must_use]
    pub fn installed_packages_all_contexts(&self) -> &[InstalledPackage] {
        &self.state.installed_packages
    }

    /// Union of installed package outputs, in installed order (later
    /// packages win on key collisions).
    #[must_use]
    pub fn context_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for pkg in self.installed_packages() {
            for (k, v) in pkg.outputs {
                env.insert(k, v);
            }
        }
        env
    }

    // =========================================================================
    // Install / Upgrade / Uninstall
    // =========================================================================

    /// Installs packages (dependencies included) into the active context.
    pub async fn install(&mut self, pkgs: &[String]) -> Result<()> {
        let (context_name, context) = self.active_context();
        if context.network.is_empty() {
            return Err(Error::ContextInstallNoNetwork);
        }
        let resolver = Resolver::new(
            self.installed_packages(),
            self.available_packages(),
            &context_name,
        )?;
        let plan = resolver.install(pkgs)?;
        let mut installed_names = Vec::new();
        let mut notes_output = String::new();
        for item in plan {
            info!(
                "Installing package {} (= {})",
                item.install.name, item.install.version
            );
            let mut opts = item.install.default_opts();
            opts.extend(item.options);
            let remembered = self
                .state
                .port_registry
                .get(&context_name)
                .and_then(|ctx| ctx.get(&item.install.name))
                .cloned();
            let result = item
                .install
                .install(&self.config, &context_name, &opts, true, remembered.as_ref())
                .await?;
            let record = InstalledPackage::new(
                item.install.clone(),
                context_name.clone(),
                result.notes.clone(),
                result.outputs,
                opts.clone(),
            );
            self.state.installed_packages.push(record);
            self.record_used_ports(&context_name, &item.install.name, result.used_ports);
            self.state.save()?;
            installed_names.push(item.install.name.clone());
            if !result.notes.is_empty() {
                notes_output.push_str(&format!(
                    "\nPost-install notes for {} (= {}):\n\n{}\n",
                    item.install.name, item.install.version, result.notes
                ));
            }
            if let Err(e) = item
                .install
                .activate(&self.config, &context_name, &opts)
                .await
            {
                warn!("failed to activate package: {}", e);
            }
        }
        if !notes_output.is_empty() {
            info!("{}", notes_output);
        }
        info!(
            "Successfully installed package(s) in context {:?}: {}",
            context_name,
            installed_names.join(", ")
        );
        Ok(())
    }

    /// Upgrades packages in the active context, preserving host ports and
    /// effective options from the previous install.
    pub async fn upgrade(&mut self, pkgs: &[String]) -> Result<()> {
        let (context_name, _) = self.active_context();
        let resolver = Resolver::new(
            self.installed_packages(),
            self.available_packages(),
            &context_name,
        )?;
        let plan = resolver.upgrade(pkgs)?;
        let mut upgraded_names = Vec::new();
        let mut notes_output = String::new();
        for item in plan {
            let opts = match &item.installed {
                // Carry the options from the existing install
                Some(installed) => installed.options.clone(),
                None => {
                    let mut opts = item.upgrade.default_opts();
                    opts.extend(item.options.clone());
                    opts
                }
            };
            let remembered = self
                .state
                .port_registry
                .get(&context_name)
                .and_then(|ctx| ctx.get(&item.upgrade.name))
                .cloned();
            if let Some(installed) = &item.installed {
                info!(
                    "Upgrading package {} ({} => {})",
                    installed.package.name, installed.package.version, item.upgrade.version
                );
                if let Err(e) = installed
                    .package
                    .deactivate(&self.config, &context_name, &installed.options)
                    .await
                {
                    warn!("failed to deactivate package: {}", e);
                }
                self.uninstall_package(installed.clone(), true, false).await?;
            } else {
                info!(
                    "Installing package {} (= {})",
                    item.upgrade.name, item.upgrade.version
                );
            }
            let result = item
                .upgrade
                .install(&self.config, &context_name, &opts, false, remembered.as_ref())
                .await?;
            let record = InstalledPackage::new(
                item.upgrade.clone(),
                context_name.clone(),
                result.notes.clone(),
                result.outputs,
                opts.clone(),
            );
            self.state.installed_packages.push(record);
            self.record_used_ports(&context_name, &item.upgrade.name, result.used_ports);
            self.state.save()?;
            upgraded_names.push(item.upgrade.name.clone());
            if !result.notes.is_empty() {
                notes_output.push_str(&format!(
                    "\nPost-install notes for {} (= {}):\n\n{}\n",
                    item.upgrade.name, item.upgrade.version, result.notes
                ));
            }
            if let Err(e) = item
                .upgrade
                .activate(&self.config, &context_name, &opts)
                .await
            {
                warn!("failed to activate package: {}", e);
            }
        }
        if !notes_output.is_empty() {
            info!("{}", notes_output);
        }
        info!(
            "Successfully upgraded/installed package(s) in context {:?}: {}",
            context_name,
            upgraded_names.join(", ")
        );
        Ok(())
    }

    /// Uninstalls a package from the active context.
    ///
    /// Unless `force`, the resolver first checks that no other installed
    /// package depends on it.
    pub async fn uninstall(&mut self, pkg_name: &str, keep_data: bool, force: bool) -> Result<()> {
        let (context_name, _) = self.active_context();
        let uninstall_pkg = self
            .installed_packages()
            .into_iter()
            .find(|pkg| pkg.package.name == pkg_name)
            .ok_or_else(|| Error::PackageNotInstalled {
                name: pkg_name.to_string(),
                context: context_name.clone(),
            })?;
        if !force {
            let resolver = Resolver::new(
                self.installed_packages(),
                self.available_packages(),
                &context_name,
            )?;
            resolver.uninstall(std::slice::from_ref(&uninstall_pkg))?;
        }
        if let Err(e) = uninstall_pkg
            .package
            .deactivate(&self.config, &context_name, &uninstall_pkg.options)
            .await
        {
            warn!("failed to deactivate package: {}", e);
        }
        let (name, version) = (
            uninstall_pkg.package.name.clone(),
            uninstall_pkg.package.version.clone(),
        );
        self.uninstall_package(uninstall_pkg, keep_data, true).await?;
        self.state.save()?;
        info!(
            "Successfully uninstalled package {} (= {}) from context {:?}",
            name, version, context_name
        );
        Ok(())
    }

    /// Runs the package uninstall and drops its state records.
    async fn uninstall_package(
        &mut self,
        pkg: InstalledPackage,
        keep_data: bool,
        run_hooks: bool,
    ) -> Result<()> {
        pkg.package
            .uninstall(&self.config, &pkg.context, &pkg.options, keep_data, run_hooks)
            .await?;
        self.state.installed_packages.retain(|installed| {
            !(installed.context == pkg.context
                && installed.package.name == pkg.package.name
                && installed.package.version == pkg.package.version)
        });
        let context_empty = match self.state.port_registry.get_mut(&pkg.context) {
            Some(ctx_registry) => {
                ctx_registry.remove(&pkg.package.name);
                ctx_registry.is_empty()
            }
            None => false,
        };
        if context_empty {
            self.state.port_registry.remove(&pkg.context);
        }
        Ok(())
    }

    fn record_used_ports(
        &mut self,
        context: &str,
        pkg_name: &str,
        used_ports: crate::ports::PackagePortRegistry,
    ) {
        if used_ports.is_empty() {
            return;
        }
        self.state
            .port_registry
            .entry(context.to_string())
            .or_default()
            .insert(pkg_name.to_string(), used_ports);
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Starts every installed package's services in the active context.
    pub async fn up(&self) -> Result<()> {
        for pkg in self.installed_packages() {
            pkg.package.start_services(&self.config, &pkg.context).await?;
        }
        Ok(())
    }

    /// Stops every installed package's services in the active context.
    pub async fn down(&self) -> Result<()> {
        for pkg in self.installed_packages() {
            pkg.package.stop_services(&self.config, &pkg.context).await?;
        }
        Ok(())
    }

    /// Human-readable info for installed packages: status and ports.
    pub async fn info(&self, pkgs: &[String]) -> Result<String> {
        let (context_name, _) = self.active_context();
        let installed = self.installed_packages();
        let mut info_pkgs = Vec::new();
        for pkg in pkgs {
            let found = installed
                .iter()
                .find(|installed| &installed.package.name == pkg)
                .ok_or_else(|| Error::PackageNotInstalled {
                    name: pkg.clone(),
                    context: context_name.clone(),
                })?;
            info_pkgs.push(found.clone());
        }
        let mut output = String::new();
        for (idx, pkg) in info_pkgs.iter().enumerate() {
            output.push_str(&format!(
                "Name: {}\nVersion: {}\nContext: {}",
                pkg.package.name, pkg.package.version, context_name
            ));
            if !pkg.post_install_notes.is_empty() {
                output.push_str(&format!(
                    "\n\nPost-install notes:\n\n{}",
                    pkg.post_install_notes
                ));
            }
            let services = pkg.package.services(&self.config, &pkg.context).await?;
            let mut status_output = String::new();
            let mut port_output = String::new();
            for svc in &services {
                let status = if svc.running { "RUNNING" } else { "NOT RUNNING" };
                status_output.push_str(&format!("{:<60} {}\n", svc.name, status));
                for port in &svc.ports {
                    let (host_port, container_port) = split_host_container(port);
                    port_output.push_str(&format!(
                        "{:<5} (host) => {:<5} (container)\n",
                        host_port, container_port
                    ));
                }
            }
            if !status_output.is_empty() {
                output.push_str(&format!(
                    "\n\nServices:\n\n{}",
                    status_output.trim_end_matches('\n')
                ));
            }
            if !port_output.is_empty() {
                output.push_str(&format!(
                    "\n\nMapped ports:\n\n{}",
                    port_output.trim_end_matches('\n')
                ));
            }
            if idx < info_pkgs.len() - 1 {
                output.push_str("\n\n---\n\n");
            }
        }
        Ok(output)
    }

    /// Streams logs from a package's first service container.
    pub async fn logs(&self, pkg_name: &str, follow: bool, tail: Option<&str>) -> Result<()> {
        let (context_name, _) = self.active_context();
        let pkg = self
            .installed_packages()
            .into_iter()
            .find(|pkg| pkg.package.name == pkg_name)
            .ok_or_else(|| Error::PackageNotInstalled {
                name: pkg_name.to_string(),
                context: context_name,
            })?;
        let services = pkg.package.services(&self.config, &pkg.context).await?;
        // TODO: account for more than one service in a package
        let Some(svc) = services.first() else {
            return Err(Error::NoServicesFound(pkg_name.to_string()));
        };
        self.config.runtime.logs(&svc.name, follow, tail).await
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// All known contexts.
    #[must_use]
    pub fn contexts(&self) -> &BTreeMap<String, Context> {
        &self.state.contexts
    }

    /// The active context name and its record.
    #[must_use]
    pub fn active_context(&self) -> (String, Context) {
        let context = self
            .state
            .contexts
            .get(&self.state.active_context)
            .cloned()
            .unwrap_or_default();
        (self.state.active_context.clone(), context)
    }

    /// Creates a context.
    pub fn add_context(&mut self, name: &str, context: Context) -> Result<()> {
        if self.state.contexts.contains_key(name) {
            return Err(Error::ContextAlreadyExists);
        }
        // Seed an empty entry, then run the shared update path so the
        // network rules apply to creation too
        self.state
            .contexts
            .insert(name.to_string(), Context::default());
        self.update_context(name, context)
    }

    /// Deletes a context. The active context cannot be deleted.
    pub fn delete_context(&mut self, name: &str) -> Result<()> {
        if name == self.state.active_context {
            return Err(Error::ContextNoDeleteActive);
        }
        if self.state.contexts.remove(name).is_none() {
            return Err(Error::ContextNotExist);
        }
        self.state.save()?;
        Ok(())
    }

    /// Switches the active context: deactivates packages in the old one,
    /// rebinds template vars, activates packages in the new one.
    pub async fn set_active_context(&mut self, name: &str) -> Result<()> {
        if !self.state.contexts.contains_key(name) {
            return Err(Error::ContextNotExist);
        }
        let (old_context, _) = self.active_context();
        for pkg in self.installed_packages() {
            if let Err(e) = pkg
                .package
                .deactivate(&self.config, &old_context, &pkg.options)
                .await
            {
                warn!("failed to deactivate package: {}", e);
            }
        }
        self.state.active_context = name.to_string();
        self.state.save()?;
        self.init_template();
        for pkg in self.installed_packages() {
            if let Err(e) = pkg
                .package
                .activate(&self.config, name, &pkg.options)
                .await
            {
                warn!("failed to activate package: {}", e);
            }
        }
        Ok(())
    }

    /// Updates a context, enforcing that the network is immutable once set
    /// and resolving the network magic for new networks.
    pub fn update_context(&mut self, name: &str, mut context: Context) -> Result<()> {
        let current = self
            .state
            .contexts
            .get(name)
            .ok_or(Error::ContextNotExist)?;
        if !current.network.is_empty() {
            if context.network != current.network {
                return Err(Error::ContextNoChangeNetwork);
            }
        } else if !context.network.is_empty() {
            context.network_magic = network_magic(&context.network)
                .ok_or_else(|| Error::UnknownNetwork(context.network.clone()))?;
        }
        self.state.contexts.insert(name.to_string(), context);
        self.state.save()?;
        self.init_template();
        Ok(())
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Strictly validates every manifest under the configured registry dir.
    pub fn validate_packages(&self) -> Result<()> {
        let dir = self
            .config
            .registry_dir
            .as_ref()
            .ok_or(Error::NoRegistryConfigured)?;
        registry::validate_packages(&self.config, dir)
    }

    /// Forces a registry refresh: drops the cache and reloads.
    pub async fn update_registry(&mut self) -> Result<()> {
        registry::clear_cache(&self.config)?;
        self.available_packages = registry::available_packages(&self.config).await?;
        info!(
            "Refreshed package registry into {:?}",
            self.config.cache_dir.join(REGISTRY_CACHE_DIR)
        );
        Ok(())
    }
}
