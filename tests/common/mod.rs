//! Shared test helpers: an in-memory container runtime and fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use cardano_up::{
    Config, ContainerInfo, ContainerRuntime, Error, PortSpec, Result, ServiceConfig,
    TemplateEngine,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Fake Runtime
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub service: ServiceConfig,
    pub running: bool,
}

/// In-memory [`ContainerRuntime`] recording every engine interaction.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    images: Mutex<BTreeSet<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.lock().unwrap().contains(image)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let containers = self.containers.lock().unwrap();
        Ok(containers.get(name).map(|c| to_info(name, c)))
    }

    async fn create_container(&self, service: &ServiceConfig) -> Result<String> {
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&service.name) {
            return Err(Error::ContainerRuntime(format!(
                "container name {:?} already in use",
                service.name
            )));
        }
        containers.insert(
            service.name.clone(),
            FakeContainer {
                service: service.clone(),
                running: false,
            },
        );
        Ok(format!("id-{}", service.name))
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or(Error::ContainerNotExists)?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or(Error::ContainerNotExists)?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        match containers.get(name) {
            None => return Err(Error::ContainerNotExists),
            Some(container) if container.running => {
                return Err(Error::ContainerRuntime(
                    "cannot remove a running container".to_string(),
                ));
            }
            Some(_) => {}
        }
        containers.remove(name);
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        if !self.images.lock().unwrap().remove(image) {
            return Err(Error::ContainerRuntime(format!("no such image: {image}")));
        }
        Ok(())
    }

    async fn logs(&self, name: &str, _follow: bool, _tail: Option<&str>) -> Result<()> {
        let containers = self.containers.lock().unwrap();
        if !containers.contains_key(name) {
            return Err(Error::ContainerNotExists);
        }
        Ok(())
    }
}

fn to_info(name: &str, container: &FakeContainer) -> ContainerInfo {
    let mut ports = Vec::new();
    for port in &container.service.ports {
        if let Ok(spec) = PortSpec::parse(port)
            && let Some(host_port) = &spec.host_port
        {
            ports.push(format!("0.0.0.0:{}:{}", host_port, spec.container_port));
        }
    }
    ContainerInfo {
        id: format!("id-{name}"),
        name: name.to_string(),
        image: container.service.image.clone(),
        running: container.running,
        ports,
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Config sandboxed inside a temp dir, wired to the given fake runtime.
pub fn test_config(temp: &TempDir, runtime: Arc<FakeRuntime>) -> Config {
    let root = temp.path();
    Config {
        bin_dir: root.join("bin"),
        cache_dir: root.join("cache"),
        config_dir: root.join("config"),
        data_dir: root.join("data"),
        registry_url: String::new(),
        registry_dir: Some(root.join("registry")),
        registry_preload: true,
        required_package_tags: Vec::new(),
        template: TemplateEngine::default(),
        runtime,
    }
}

/// Writes a manifest at the registry location the validator expects
/// (`{name}/{name}-{version}.yaml`).
pub fn write_manifest(registry_dir: &Path, name: &str, version: &str, body: &str) {
    let dir = registry_dir.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let header = format!("name: {name}\nversion: {version}\n");
    std::fs::write(
        dir.join(format!("{name}-{version}.yaml")),
        format!("{header}{body}"),
    )
    .unwrap();
}
