//! Install-step executors.
//!
//! Each step variant knows how to install, uninstall, activate, and
//! deactivate itself. Docker steps talk to the container runtime through
//! the config's handle and route their port specs through the allocator;
//! file steps materialise artifacts under the package data dir and manage
//! bin-dir symlinks on activation.

use crate::config::Config;
use crate::constants::{CONTAINER_STOP_TIMEOUT, DEFAULT_FILE_MODE};
use crate::docker::ServiceConfig;
use crate::error::{Error, Result};
use crate::package::{DockerStep, FileStep};
use crate::ports::{ServicePortMap, allocate_host_port};
use serde_json::json;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

// =============================================================================
// Docker Steps
// =============================================================================

impl DockerStep {
    /// Verifies the runtime is reachable and the container name is free.
    ///
    /// The check is inherently racy against other engine clients; a
    /// duplicate name surfaces later as a create error.
    pub async fn preflight(&self, cfg: &Config, pkg_name: &str) -> Result<()> {
        cfg.runtime.ping().await?;
        let container_name = format!("{pkg_name}-{}", self.container_name);
        match cfg.runtime.find_container(&container_name).await? {
            Some(_) => Err(Error::ContainerAlreadyExists),
            None => Ok(()),
        }
    }

    /// Renders the step, allocates host ports, and creates/starts the
    /// container (or only pulls the image for pull-only steps).
    pub async fn install(
        &self,
        cfg: &Config,
        pkg_name: &str,
        remembered: &ServicePortMap,
        used: &mut ServicePortMap,
    ) -> Result<()> {
        let container_name = format!("{pkg_name}-{}", self.container_name);
        let extra = json!({ "Container": { "Name": container_name } });
        let render = |body: &str| cfg.template.render(body, Some(&extra));
        let image = render(&self.image)?;
        let mut env = BTreeMap::new();
        for (k, v) in &self.env {
            env.insert(k.clone(), render(v)?);
        }
        let entrypoint = self
            .command
            .iter()
            .map(|c| render(c))
            .collect::<Result<Vec<_>>>()?;
        let command = self
            .args
            .iter()
            .map(|a| render(a))
            .collect::<Result<Vec<_>>>()?;
        let mut binds = Vec::new();
        for bind in &self.binds {
            let bind = render(bind)?;
            // Precreate host paths for bind mounts so non-root ownership is
            // preserved when the container writes into them
            if let Some((host_path, _)) = bind.split_once(':') {
                debug!("precreating host path for container bind mount: {:?}", host_path);
                std::fs::create_dir_all(host_path)?;
            }
            binds.push(bind);
        }
        let mut ports = Vec::new();
        for port in &self.ports {
            let port = render(port)?;
            ports.push(allocate_host_port(&port, remembered, used)?);
        }
        let service = ServiceConfig {
            name: container_name,
            image: image.clone(),
            env,
            entrypoint,
            command,
            binds,
            ports,
        };
        cfg.runtime.pull_image(&image).await?;
        if !self.pull_only {
            cfg.runtime.create_container(&service).await?;
            cfg.runtime.start_container(&service.name).await?;
        }
        Ok(())
    }

    /// Stops and removes the container, then the image unless data is kept.
    pub async fn uninstall(&self, cfg: &Config, pkg_name: &str, keep_data: bool) -> Result<()> {
        if !self.pull_only {
            let container_name = format!("{pkg_name}-{}", self.container_name);
            match cfg.runtime.find_container(&container_name).await? {
                None => {
                    debug!("container missing on uninstall: {}", container_name);
                }
                Some(info) => {
                    if info.running {
                        cfg.runtime
                            .stop_container(&container_name, CONTAINER_STOP_TIMEOUT)
                            .await?;
                    }
                    cfg.runtime.remove_container(&container_name).await?;
                }
            }
        }
        if keep_data {
            debug!("skipping deletion of docker image {:?}", self.image);
        } else {
            match cfg.runtime.remove_image(&self.image).await {
                Ok(()) => debug!("removed unused image {:?}", self.image),
                Err(e) => debug!("failed to delete image {:?}: {}", self.image, e),
            }
        }
        Ok(())
    }
}

// =============================================================================
// File Steps
// =============================================================================

impl FileStep {
    /// Writes the file under `{DataDir}/{pkgName}`.
    ///
    /// Content comes from `content` (rendered), `source` (manifest-relative
    /// file, rendered), or `url` (downloaded verbatim).
    pub async fn install(
        &self,
        cfg: &Config,
        pkg_name: &str,
        manifest_path: &Path,
    ) -> Result<()> {
        let filename = cfg.template.render(&self.filename, None)?;
        let file_path = cfg.data_dir.join(pkg_name).join(&filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = if !self.url.is_empty() {
            self.fetch_url().await?
        } else {
            let content = if self.source.is_empty() {
                self.content.clone()
            } else {
                let source_path = manifest_path
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(&self.source);
                std::fs::read_to_string(&source_path)?
            };
            cfg.template.render(&content, None)?.into_bytes()
        };
        std::fs::write(&file_path, bytes)?;
        set_mode(&file_path, self.mode.unwrap_or(DEFAULT_FILE_MODE))?;
        debug!("wrote file {:?}", file_path);
        Ok(())
    }

    async fn fetch_url(&self) -> Result<Vec<u8>> {
        let url: reqwest::Url = self.url.parse().map_err(|e| Error::ManifestParse {
            path: None,
            reason: format!("invalid file url {:?}: {e}", self.url),
        })?;
        if url.scheme().is_empty() || url.host_str().is_none_or(str::is_empty) {
            return Err(Error::ManifestParse {
                path: None,
                reason: format!("file url {:?} must have a scheme and host", self.url),
            });
        }
        let resp = reqwest::get(url).await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Best-effort removal of the installed file.
    pub fn uninstall(&self, cfg: &Config, pkg_name: &str) -> Result<()> {
        let file_path = cfg.data_dir.join(pkg_name).join(&self.filename);
        debug!("deleting file {:?}", file_path);
        if let Err(e) = std::fs::remove_file(&file_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("failed to remove file {:?}: {}", file_path, e);
        }
        Ok(())
    }

    /// For binaries, symlinks the installed file into the bin dir.
    ///
    /// An existing symlink at the destination is replaced; any other
    /// existing file is left alone and the activation fails.
    pub fn activate(&self, cfg: &Config, pkg_name: &str) -> Result<()> {
        if !self.binary {
            return Ok(());
        }
        let filename = cfg.template.render(&self.filename, None)?;
        let file_path = cfg.data_dir.join(pkg_name).join(&filename);
        let bin_path = cfg.bin_dir.join(&filename);
        if let Some(parent) = bin_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::symlink_metadata(&bin_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if let Err(e) = std::fs::remove_file(&bin_path)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    return Err(e.into());
                }
                debug!("removed existing symlink {:?}", bin_path);
            }
            Ok(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!(
                        "will not overwrite existing file {:?} with symlink",
                        bin_path
                    ),
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        symlink(&file_path, &bin_path)?;
        debug!("wrote symlink from {:?} to {:?}", bin_path, file_path);
        Ok(())
    }

    /// For binaries, removes the bin-dir symlink. Absent is not an error.
    pub fn deactivate(&self, cfg: &Config, _pkg_name: &str) -> Result<()> {
        if !self.binary {
            return Ok(());
        }
        let filename = cfg.template.render(&self.filename, None)?;
        let bin_path = cfg.bin_dir.join(&filename);
        if let Err(e) = std::fs::remove_file(&bin_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            return Err(e.into());
        }
        debug!("removed symlink {:?}", bin_path);
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "binary activation requires symlink support",
    ))
}
