//! Package manager configuration.
//!
//! A `Config` carries the per-user directory layout, the registry source,
//! the platform tag filter, the template namespace, and the container
//! runtime handle. The CLI builds one per invocation from the environment;
//! tests build one pointing at temp dirs and a fake runtime.

use crate::constants::{DEFAULT_REGISTRY_URL, PROGRAM_NAME};
use crate::docker::{ContainerRuntime, DockerRuntime};
use crate::error::{Error, Result};
use crate::template::TemplateEngine;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared configuration threaded through every component.
#[derive(Clone)]
pub struct Config {
    /// Directory for activated binary symlinks (`~/.local/bin`).
    pub bin_dir: PathBuf,
    /// Per-user cache directory (registry archive, package caches).
    pub cache_dir: PathBuf,
    /// Per-user config directory (state files).
    pub config_dir: PathBuf,
    /// Per-user data directory (package data, context data).
    pub data_dir: PathBuf,
    /// Remote registry archive URL. Ignored when `registry_dir` is set.
    pub registry_url: String,
    /// Local registry directory, overriding the remote archive.
    pub registry_dir: Option<PathBuf>,
    /// Whether the manager loads the registry at construction time.
    pub registry_preload: bool,
    /// Tags a package must carry to be considered available.
    pub required_package_tags: Vec<String>,
    /// Base template namespace. The manager layers context vars on top.
    pub template: TemplateEngine,
    /// Container runtime handle.
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl Config {
    /// Builds the default per-user configuration from the environment.
    ///
    /// Honors `XDG_CONFIG_HOME`/`XDG_CACHE_HOME` ahead of the platform
    /// defaults, and `REGISTRY_URL`/`REGISTRY_DIR` for the package source.
    pub fn default_config() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine user home directory",
            ))
        })?;
        let config_base = xdg_dir("XDG_CONFIG_HOME").or_else(dirs::config_dir).ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine user config directory",
            ))
        })?;
        let cache_base = xdg_dir("XDG_CACHE_HOME").or_else(dirs::cache_dir).ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine user cache directory",
            ))
        })?;
        let registry_url =
            std::env::var("REGISTRY_URL").unwrap_or_else(|_| DEFAULT_REGISTRY_URL.to_string());
        let registry_dir = std::env::var("REGISTRY_DIR").ok().map(PathBuf::from);
        Ok(Self {
            bin_dir: home.join(".local").join("bin"),
            cache_dir: cache_base.join(PROGRAM_NAME),
            config_dir: config_base.join(PROGRAM_NAME),
            data_dir: home.join(".local").join("share").join(PROGRAM_NAME),
            registry_url,
            registry_dir,
            registry_preload: true,
            required_package_tags: vec![
                "docker".to_string(),
                std::env::consts::OS.to_string(),
                std::env::consts::ARCH.to_string(),
            ],
            template: TemplateEngine::default(),
            runtime: Arc::new(DockerRuntime::from_env()),
        })
    }
}

fn xdg_dir(var: &str) -> Option<PathBuf> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Some(PathBuf::from(v)),
        _ => None,
    }
}
