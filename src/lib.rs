//! # cardano-up
//!
//! **Per-User Package Manager for Docker-Hosted Cardano Services**
//!
//! This crate installs, upgrades, uninstalls, and operates composite
//! services described by declarative YAML manifests. A package is an
//! ordered list of install steps — container instances and on-disk files —
//! that together stand up a runnable application on the user's machine.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        PackageManager                           │
//! │   Install │ Upgrade │ Uninstall │ Up/Down │ Info │ Contexts     │
//! ├──────────────┬──────────────────┬───────────────────────────────┤
//! │   Resolver   │     Registry     │          State Store          │
//! │  constraints │  dir / ZIP cache │  contexts, installed, ports   │
//! ├──────────────┴──────────────────┴───────────────────────────────┤
//! │                        Package Engine                           │
//! │     steps in order │ conditions │ hooks │ outputs │ notes       │
//! ├───────────────────────────┬─────────────────────────────────────┤
//! │    Install-Step Executor  │          Port Allocator             │
//! │      docker │ file        │   remembered → ephemeral probe      │
//! ├───────────────────────────┴─────────────────────────────────────┤
//! │            ContainerRuntime (Docker Engine API)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Contexts
//!
//! Installed packages live in *contexts*: named, independent environments
//! with their own network configuration, installed-package set, and host
//! port registry. Exactly one context is active at a time, so multiple
//! variants of the same package can coexist side by side.
//!
//! # State
//!
//! All state persists as YAML under the per-user config dir and survives
//! across invocations:
//!
//! | File | Contents |
//! |------|----------|
//! | `contexts.yaml` | context-name → context |
//! | `active_context.yaml` | active context name |
//! | `installed_packages.yaml` | installed-package records |
//! | `port_registry.yaml` | context → package → service → port map |
//!
//! Host ports allocated for a package are remembered per container port,
//! so upgrades keep their bindings stable.
//!
//! # Example
//!
//! ```rust,ignore
//! use cardano_up::PackageManager;
//!
//! #[tokio::main]
//! async fn main() -> cardano_up::Result<()> {
//!     let mut pm = PackageManager::new_default().await?;
//!     pm.install(&["cardano-node".to_string()]).await?;
//!     pm.up().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod constants;
mod context;
mod docker;
mod error;
mod manager;
mod package;
mod ports;
mod registry;
mod resolver;
mod state;
mod steps;
mod template;

pub use config::Config;
pub use constants::{DEFAULT_CONTEXT_NAME, PROGRAM_NAME};
pub use context::{Context, network_magic};
pub use docker::{ContainerInfo, ContainerRuntime, DockerRuntime, ServiceConfig};
pub use error::{Error, Result};
pub use manager::PackageManager;
pub use package::{
    DockerStep, FileStep, InstallResult, InstallStep, InstalledPackage, Package, PackageOption,
    PackageOutput, StepMethod, output_env_key,
};
pub use ports::{
    ContextPortRegistry, PackagePortRegistry, PortRegistry, PortSpec, Protocol, ServicePortMap,
    allocate_host_port, ephemeral_port, split_host_container,
};
pub use registry::{available_packages, packages_from_dir, validate_packages};
pub use resolver::{Constraint, InstallSet, Resolver, UpgradeSet, parse_constraints,
    parse_version, split_package};
pub use state::State;
pub use template::TemplateEngine;
