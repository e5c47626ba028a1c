//! Package manifests and the package lifecycle engine.
//!
//! A package is a declarative manifest: an ordered list of install steps
//! (container instances and on-disk files) plus dependencies, options,
//! outputs, and hook scripts. This module owns the manifest data model and
//! drives a package through its verbs: install, uninstall, activate,
//! deactivate, and the service start/stop passes.
//!
//! ## Install Flow
//!
//! ```text
//! bind template vars → preflight → create dirs → pre-install hook
//!   → steps in manifest order (conditions respected)
//!   → capture used ports → render outputs → post-install hook → notes
//! ```
//!
//! Uninstall runs the steps in reverse. Manifests are parsed strictly:
//! unknown fields are rejected, and each install step must carry exactly
//! one method (`docker` or `file`), which the parser enforces structurally.

use crate::config::Config;
use crate::constants::CONTAINER_STOP_TIMEOUT;
use crate::docker::ContainerInfo;
use crate::error::{Error, Result};
use crate::ports::{PackagePortRegistry, split_host_container};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

// =============================================================================
// Manifest Model
// =============================================================================

/// A package manifest. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub description: String,
    pub install_steps: Vec<InstallStep>,
    /// Dependency specs (`name[optA,-optB] >= 1.0.2, < 2.0.0`).
    pub dependencies: Vec<String>,
    /// Platform/feature tags used for availability filtering.
    pub tags: Vec<String>,
    pub pre_install_script: String,
    pub post_install_script: String,
    pub pre_uninstall_script: String,
    pub post_uninstall_script: String,
    pub pre_start_script: String,
    pub pre_stop_script: String,
    /// Template rendered and shown to the user after install.
    pub post_install_notes: String,
    pub options: Vec<PackageOption>,
    pub outputs: Vec<PackageOutput>,
    /// Originating manifest path; used only for relative file resolution.
    #[serde(skip)]
    pub file_path: PathBuf,
}

/// A boolean toggle declared by a manifest, surfaced to templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct PackageOption {
    pub name: String,
    pub description: String,
    pub default: bool,
}

/// A declared output: the rendered value becomes an exported env var.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct PackageOutput {
    pub name: String,
    pub description: String,
    /// Value template, rendered after install steps run.
    pub value: String,
}

/// One declarative install step with an optional condition.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallStep {
    /// Template condition; the step is skipped when it evaluates false.
    pub condition: Option<String>,
    pub method: StepMethod,
}

/// The step payload. Exactly one method per step, by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepMethod {
    Docker(DockerStep),
    File(FileStep),
}

/// A container instance to create and run (or an image to pre-pull).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct DockerStep {
    /// Container name stem; the full name is
    /// `{pkg}-{version}-{context}-{stem}`.
    pub container_name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Entrypoint override.
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub binds: Vec<String>,
    /// Port specs (`[ip:][hp:]cp[/proto]`).
    pub ports: Vec<String>,
    /// Pull the image without creating a container.
    pub pull_only: bool,
}

/// A file to materialise under the package data dir.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct FileStep {
    /// Symlink the file into the user bin dir on activate.
    pub binary: bool,
    /// Destination filename (template), relative to the package data dir.
    pub filename: String,
    /// Source path relative to the manifest.
    pub source: String,
    /// Literal content (template).
    pub content: String,
    /// Remote source; downloaded bytes are written verbatim.
    pub url: String,
    /// File mode; defaults when absent.
    pub mode: Option<u32>,
}

// The YAML shape keeps `docker`/`file` as sibling keys, so the exactly-one
// invariant is checked here and the step collapses into the enum.
#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
struct RawInstallStep {
    condition: Option<String>,
    docker: Option<DockerStep>,
    file: Option<FileStep>,
}

impl<'de> Deserialize<'de> for InstallStep {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawInstallStep::deserialize(deserializer)?;
        let method = match (raw.docker, raw.file) {
            (Some(_), Some(_)) => {
                return Err(D::Error::custom(Error::MultipleInstallMethods.to_string()));
            }
            (Some(docker), None) => StepMethod::Docker(docker),
            (None, Some(file)) => StepMethod::File(file),
            (None, None) => {
                return Err(D::Error::custom(Error::NoInstallMethods.to_string()));
            }
        };
        Ok(Self {
            condition: raw.condition.filter(|c| !c.is_empty()),
            method,
        })
    }
}

impl Serialize for InstallStep {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        if let Some(condition) = &self.condition {
            map.serialize_entry("condition", condition)?;
        }
        match &self.method {
            StepMethod::Docker(step) => map.serialize_entry("docker", step)?,
            StepMethod::File(step) => map.serialize_entry("file", step)?,
        }
        map.end()
    }
}

// =============================================================================
// Installed Packages
// =============================================================================

/// A snapshot of a manifest at install time, bound to a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPackage {
    pub package: Package,
    pub context: String,
    #[serde(default)]
    pub post_install_notes: String,
    pub installed_time: DateTime<Utc>,
    #[serde(default)]
    pub options: BTreeMap<String, bool>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl InstalledPackage {
    /// Creates an installed-package record stamped with the current time.
    #[must_use]
    pub fn new(
        package: Package,
        context: String,
        post_install_notes: String,
        outputs: BTreeMap<String, String>,
        options: BTreeMap<String, bool>,
    ) -> Self {
        Self {
            package,
            context,
            post_install_notes,
            installed_time: Utc::now(),
            options,
            outputs,
        }
    }
}

/// Result of a package install.
#[derive(Debug, Default)]
pub struct InstallResult {
    /// Rendered post-install notes (empty when the manifest has none).
    pub notes: String,
    /// Rendered outputs keyed by env-var name.
    pub outputs: BTreeMap<String, String>,
    /// Host ports chosen during this install, per service.
    pub used_ports: PackagePortRegistry,
}

// =============================================================================
// Package Engine
// =============================================================================

impl Package {
    /// Parses a manifest from YAML, rejecting unknown fields.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::ManifestParse {
            path: None,
            reason: e.to_string(),
        })
    }

    /// Loads a manifest file, remembering its path for relative sources.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut pkg = Self::from_yaml(&content).map_err(|e| match e {
            Error::ManifestParse { reason, .. } => Error::ManifestParse {
                path: Some(path.display().to_string()),
                reason,
            },
            other => other,
        })?;
        pkg.file_path = path.to_path_buf();
        Ok(pkg)
    }

    /// True when the manifest carries neither name nor version.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.version.is_empty()
    }

    /// Name a package instance gets within a context.
    #[must_use]
    pub fn full_name(&self, context: &str) -> String {
        format!("{}-{}-{}", self.name, self.version, context)
    }

    /// Option defaults declared by the manifest.
    #[must_use]
    pub fn default_opts(&self) -> BTreeMap<String, bool> {
        self.options
            .iter()
            .map(|opt| (opt.name.clone(), opt.default))
            .collect()
    }

    /// True when the package carries every one of the given tags.
    #[must_use]
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Installs the package into a context.
    ///
    /// `remembered` carries host ports from a previous install of the same
    /// package so upgrades keep their bindings. Returns rendered notes,
    /// output env vars, and the ports actually used.
    pub async fn install(
        &self,
        cfg: &Config,
        context: &str,
        opts: &BTreeMap<String, bool>,
        run_hooks: bool,
        remembered: Option<&PackagePortRegistry>,
    ) -> Result<InstallResult> {
        let pkg_name = self.full_name(context);
        let cfg = self.bind_package_vars(cfg, context, opts);
        // Pre-flight checks
        for step in &self.install_steps {
            if let StepMethod::Docker(docker) = &step.method {
                docker.preflight(&cfg, &pkg_name).await?;
            }
        }
        // Pre-create dirs
        std::fs::create_dir_all(cfg.cache_dir.join(&pkg_name))?;
        std::fs::create_dir_all(cfg.data_dir.join(context))?;
        std::fs::create_dir_all(cfg.data_dir.join(&pkg_name))?;
        if run_hooks && !self.pre_install_script.is_empty() {
            self.run_hook_script(&cfg, &self.pre_install_script).await?;
        }
        // Perform install
        let empty = crate::ports::ServicePortMap::new();
        let mut used_ports = PackagePortRegistry::new();
        for step in &self.install_steps {
            if self.skip_step(&cfg, step, "install")? {
                continue;
            }
            match &step.method {
                StepMethod::Docker(docker) => {
                    let remembered_svc = remembered
                        .and_then(|r| r.get(&docker.container_name))
                        .unwrap_or(&empty);
                    let mut used = crate::ports::ServicePortMap::new();
                    docker
                        .install(&cfg, &pkg_name, remembered_svc, &mut used)
                        .await?;
                    if !used.is_empty() {
                        used_ports.insert(docker.container_name.clone(), used);
                    }
                }
                StepMethod::File(file) => {
                    file.install(&cfg, &pkg_name, &self.file_path).await?;
                }
            }
        }
        // Capture port details for output templates
        let mut ports_vars = serde_json::Map::new();
        for svc in self.services(&cfg, context).await? {
            let short_name = svc
                .name
                .strip_prefix(&format!("{pkg_name}-"))
                .unwrap_or(&svc.name)
                .to_string();
            let mut svc_ports = serde_json::Map::new();
            for port in &svc.ports {
                let (host_port, container_port) = split_host_container(port);
                svc_ports.insert(container_port, serde_json::Value::String(host_port));
            }
            ports_vars.insert(short_name, serde_json::Value::Object(svc_ports));
        }
        let cfg = {
            let mut cfg = cfg;
            cfg.template = cfg.template.with_vars(json!({ "Ports": ports_vars }));
            cfg
        };
        // Generate outputs
        let mut outputs = BTreeMap::new();
        for output in &self.outputs {
            let key = output_env_key(&self.name, &output.name);
            let value = cfg.template.render(&output.value, None)?;
            outputs.insert(key, value);
        }
        if run_hooks && !self.post_install_script.is_empty() {
            self.run_hook_script(&cfg, &self.post_install_script).await?;
        }
        let notes = if self.post_install_notes.is_empty() {
            String::new()
        } else {
            cfg.template.render(&self.post_install_notes, None)?
        };
        Ok(InstallResult {
            notes,
            outputs,
            used_ports,
        })
    }

    /// Uninstalls the package, iterating steps in reverse.
    pub async fn uninstall(
        &self,
        cfg: &Config,
        context: &str,
        opts: &BTreeMap<String, bool>,
        keep_data: bool,
        run_hooks: bool,
    ) -> Result<()> {
        let pkg_name = self.full_name(context);
        let cfg = self.bind_package_vars(cfg, context, opts);
        if run_hooks && !self.pre_uninstall_script.is_empty() {
            self.run_hook_script(&cfg, &self.pre_uninstall_script).await?;
        }
        for step in self.install_steps.iter().rev() {
            if self.skip_step(&cfg, step, "uninstall")? {
                continue;
            }
            match &step.method {
                StepMethod::Docker(docker) => {
                    docker.uninstall(&cfg, &pkg_name, keep_data).await?;
                }
                StepMethod::File(file) => file.uninstall(&cfg, &pkg_name)?,
            }
        }
        if keep_data {
            debug!("skipping cleanup of package data/cache directories");
        } else {
            for dir in [cfg.cache_dir.join(&pkg_name), cfg.data_dir.join(&pkg_name)] {
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => debug!("removed package directory {:?}", dir),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("failed to remove package directory {:?}: {}", dir, e),
                }
            }
        }
        if run_hooks && !self.post_uninstall_script.is_empty() {
            self.run_hook_script(&cfg, &self.post_uninstall_script)
                .await?;
        }
        Ok(())
    }

    /// Makes the package's user-facing artifacts visible on the host.
    pub async fn activate(
        &self,
        cfg: &Config,
        context: &str,
        opts: &BTreeMap<String, bool>,
    ) -> Result<()> {
        let pkg_name = self.full_name(context);
        let cfg = self.bind_package_vars(cfg, context, opts);
        for step in &self.install_steps {
            if self.skip_step(&cfg, step, "activate")? {
                continue;
            }
            match &step.method {
                // Nothing to do for containers
                StepMethod::Docker(_) => {}
                StepMethod::File(file) => file.activate(&cfg, &pkg_name)?,
            }
        }
        Ok(())
    }

    /// Inverse of [`Package::activate`].
    pub async fn deactivate(
        &self,
        cfg: &Config,
        context: &str,
        opts: &BTreeMap<String, bool>,
    ) -> Result<()> {
        let pkg_name = self.full_name(context);
        let cfg = self.bind_package_vars(cfg, context, opts);
        for step in &self.install_steps {
            if self.skip_step(&cfg, step, "deactivate")? {
                continue;
            }
            match &step.method {
                StepMethod::Docker(_) => {}
                StepMethod::File(file) => file.deactivate(&cfg, &pkg_name)?,
            }
        }
        Ok(())
    }

    /// Starts every service container, running the pre-start hook first.
    ///
    /// Failures are collected per service; the pass continues and reports
    /// one composite failure at the end.
    pub async fn start_services(&self, cfg: &Config, context: &str) -> Result<()> {
        let pkg_name = self.full_name(context);
        let cfg = self.bind_package_vars(cfg, context, &self.default_opts());
        if !self.pre_start_script.is_empty() {
            self.run_hook_script(&cfg, &self.pre_start_script).await?;
        }
        let mut failures = Vec::new();
        for step in &self.install_steps {
            let StepMethod::Docker(docker) = &step.method else {
                continue;
            };
            if docker.pull_only {
                continue;
            }
            let container_name = format!("{pkg_name}-{}", docker.container_name);
            tracing::info!("Starting container {}", container_name);
            match cfg.runtime.find_container(&container_name).await {
                Ok(Some(_)) => {
                    if let Err(e) = cfg.runtime.start_container(&container_name).await {
                        failures.push(format!(
                            "failed to start container {container_name}: {e}"
                        ));
                    }
                }
                Ok(None) => failures.push(format!("no such container: {container_name}")),
                Err(e) => failures.push(format!(
                    "error looking up container {container_name}: {e}"
                )),
            }
        }
        if !failures.is_empty() {
            error!("{}", failures.join("\n"));
            return Err(Error::OperationFailed);
        }
        Ok(())
    }

    /// Stops every service container, running the pre-stop hook first.
    pub async fn stop_services(&self, cfg: &Config, context: &str) -> Result<()> {
        let pkg_name = self.full_name(context);
        let cfg = self.bind_package_vars(cfg, context, &self.default_opts());
        if !self.pre_stop_script.is_empty() {
            self.run_hook_script(&cfg, &self.pre_stop_script).await?;
        }
        let mut failures = Vec::new();
        for step in &self.install_steps {
            let StepMethod::Docker(docker) = &step.method else {
                continue;
            };
            if docker.pull_only {
                continue;
            }
            let container_name = format!("{pkg_name}-{}", docker.container_name);
            tracing::info!("Stopping container {}", container_name);
            match cfg.runtime.find_container(&container_name).await {
                Ok(Some(info)) if info.running => {
                    if let Err(e) = cfg
                        .runtime
                        .stop_container(&container_name, CONTAINER_STOP_TIMEOUT)
                        .await
                    {
                        failures.push(format!(
                            "failed to stop container {container_name}: {e}"
                        ));
                    }
                }
                Ok(_) => {}
                Err(e) => failures.push(format!(
                    "error looking up container {container_name}: {e}"
                )),
            }
        }
        if !failures.is_empty() {
            error!("{}", failures.join("\n"));
            return Err(Error::OperationFailed);
        }
        Ok(())
    }

    /// Live containers belonging to this package instance.
    pub async fn services(&self, cfg: &Config, context: &str) -> Result<Vec<ContainerInfo>> {
        let pkg_name = self.full_name(context);
        let mut services = Vec::new();
        for step in &self.install_steps {
            let StepMethod::Docker(docker) = &step.method else {
                continue;
            };
            if docker.pull_only {
                continue;
            }
            let container_name = format!("{pkg_name}-{}", docker.container_name);
            match cfg.runtime.find_container(&container_name).await? {
                Some(info) => services.push(info),
                None => debug!("no container found for service {}", container_name),
            }
        }
        Ok(services)
    }

    /// Validates the manifest: name charset, version, expected file path,
    /// and each install step.
    pub fn validate(&self, cfg: &Config) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ManifestParse {
                path: None,
                reason: "package name cannot be empty".to_string(),
            });
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::ManifestParse {
                path: None,
                reason: format!("invalid package name: {}", self.name),
            });
        }
        if self.version.is_empty() {
            return Err(Error::ManifestParse {
                path: None,
                reason: "package version cannot be empty".to_string(),
            });
        }
        crate::resolver::parse_version(&self.version)?;
        let expected_suffix = format!("{}/{}-{}.yaml", self.name, self.name, self.version);
        if !self
            .file_path
            .to_string_lossy()
            .ends_with(&expected_suffix)
        {
            return Err(Error::ManifestParse {
                path: Some(self.file_path.display().to_string()),
                reason: format!("package did not have expected file path: {expected_suffix}"),
            });
        }
        for step in &self.install_steps {
            if let Some(condition) = &step.condition {
                cfg.template
                    .evaluate_condition(condition, None)
                    .map_err(|e| Error::InstallStepCondition {
                        condition: condition.clone(),
                        reason: e.to_string(),
                    })?;
            }
            match &step.method {
                StepMethod::Docker(docker) => {
                    if docker.image.is_empty() {
                        return Err(Error::ManifestParse {
                            path: None,
                            reason: "docker image must be provided".to_string(),
                        });
                    }
                }
                StepMethod::File(file) => {
                    if file.filename.is_empty() {
                        return Err(Error::ManifestParse {
                            path: None,
                            reason: "file filename must be provided".to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Layers the package-scoped template vars over the config namespace.
    fn bind_package_vars(
        &self,
        cfg: &Config,
        context: &str,
        opts: &BTreeMap<String, bool>,
    ) -> Config {
        let pkg_name = self.full_name(context);
        let mut cfg = cfg.clone();
        cfg.template = cfg.template.with_vars(json!({
            "Package": {
                "Name": pkg_name,
                "ShortName": self.name,
                "Version": self.version,
                "Options": opts,
            },
            "Paths": {
                "CacheDir": cfg.cache_dir.join(&pkg_name),
                "ContextDir": cfg.data_dir.join(context),
                "DataDir": cfg.data_dir.join(&pkg_name),
                "BinDir": cfg.bin_dir,
            },
            "System": {
                "OS": std::env::consts::OS,
                "ARCH": std::env::consts::ARCH,
            },
        }));
        cfg
    }

    /// Evaluates a step condition, logging when the step is skipped.
    fn skip_step(&self, cfg: &Config, step: &InstallStep, verb: &str) -> Result<bool> {
        let Some(condition) = &step.condition else {
            return Ok(false);
        };
        let ok = cfg
            .template
            .evaluate_condition(condition, None)
            .map_err(|e| Error::InstallStepCondition {
                condition: condition.clone(),
                reason: e.to_string(),
            })?;
        if !ok {
            debug!("skipping {} step due to condition: {}", verb, condition);
        }
        Ok(!ok)
    }

    /// Runs a hook script through the platform shell with inherited stdio.
    async fn run_hook_script(&self, cfg: &Config, script: &str) -> Result<()> {
        let rendered = cfg
            .template
            .render(script, None)
            .map_err(|e| Error::HookScript(format!("failed to render script: {e}")))?;
        let status = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&rendered)
            .status()
            .await
            .map_err(|e| Error::HookScript(format!("failed to run script: {e}")))?;
        if !status.success() {
            return Err(Error::HookScript(format!(
                "script exited with status {status}"
            )));
        }
        Ok(())
    }
}

/// Env-var key for an output: `{pkg}_{output}` with every run of
/// non-alphanumeric characters collapsed to `_`, uppercased.
#[must_use]
pub fn output_env_key(pkg_name: &str, output_name: &str) -> String {
    let raw = format!("{pkg_name}_{output_name}");
    let mut key = String::with_capacity(raw.len());
    let mut gap = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_uppercase());
            gap = false;
        } else if !gap {
            key.push('_');
            gap = true;
        }
    }
    key
}
