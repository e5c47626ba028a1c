//! cardano-up - package manager CLI
//!
//! Installs and operates Docker-hosted Cardano services from declarative
//! package manifests.
//!
//! ## Usage
//!
//! ```sh
//! cardano-up install cardano-node
//! cardano-up up
//! cardano-up logs cardano-node -f
//! cardano-up context create testnet -n preview
//! ```
//!
//! Exit code is 0 on success and 1 on error; errors are logged rather than
//! printed as panics or raw stack traces.

use cardano_up::{Config, Context, Error, PackageManager};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cardano-up", version, about = "Manage Docker-hosted Cardano services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available packages
    ListAvailable {
        /// Show all versions instead of the latest per package
        #[arg(short = 'v', long)]
        all_versions: bool,
    },
    /// List installed packages
    List {
        /// Include all contexts, not just the active one
        #[arg(short = 'A', long)]
        all_contexts: bool,
    },
    /// Install a package
    Install {
        /// Package spec (e.g. `cardano-node` or `cardano-node >= 1.0.2`)
        package: String,
        /// Network for the active context when not yet configured
        #[arg(short = 'n', long)]
        network: Option<String>,
    },
    /// Upgrade a package
    Upgrade {
        package: String,
    },
    /// Uninstall a package
    Uninstall {
        package: String,
        /// Keep package data directories and images
        #[arg(short = 'k', long)]
        keep_data: bool,
        /// Skip the dependency check
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Start all services in the active context
    Up,
    /// Stop all services in the active context
    Down,
    /// Show info for installed packages
    Info {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Show logs for an installed package
    Logs {
        package: String,
        /// Follow log output
        #[arg(short = 'f', long)]
        follow: bool,
        /// Display at most this many lines from the end of the log
        #[arg(short = 'n', long)]
        tail: Option<String>,
    },
    /// Force a registry cache refresh
    Update,
    /// Validate package manifests in a directory
    Validate {
        path: Option<PathBuf>,
    },
    /// Manage contexts
    Context {
        #[command(subcommand)]
        command: ContextCommands,
    },
    /// Print version
    Version,
}

#[derive(Subcommand)]
enum ContextCommands {
    /// List available contexts
    List,
    /// Select the active context
    Select { name: String },
    /// Create a new context
    Create {
        name: String,
        /// Description for the context
        #[arg(short = 'd', long)]
        description: Option<String>,
        /// Network for the context; set automatically on first install
        /// when omitted
        #[arg(short = 'n', long)]
        network: Option<String>,
    },
    /// Delete a context
    Delete {
        name: String,
        /// Force removal of a context with packages installed
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Generate environment vars for the current context
    Env,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .without_time()
        .init();
    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> cardano_up::Result<()> {
    match command {
        Commands::ListAvailable { all_versions } => cmd_list_available(all_versions).await,
        Commands::List { all_contexts } => cmd_list(all_contexts).await,
        Commands::Install { package, network } => cmd_install(package, network).await,
        Commands::Upgrade { package } => {
            let mut pm = PackageManager::new_default().await?;
            pm.upgrade(&[package]).await
        }
        Commands::Uninstall {
            package,
            keep_data,
            force,
        } => {
            let mut pm = PackageManager::new_default().await?;
            pm.uninstall(&package, keep_data, force).await
        }
        Commands::Up => PackageManager::new_default().await?.up().await,
        Commands::Down => PackageManager::new_default().await?.down().await,
        Commands::Info { packages } => {
            let pm = PackageManager::new_default().await?;
            let output = pm.info(&packages).await?;
            info!("{}", output);
            Ok(())
        }
        Commands::Logs {
            package,
            follow,
            tail,
        } => {
            let pm = PackageManager::new_default().await?;
            pm.logs(&package, follow, tail.as_deref()).await
        }
        Commands::Update => {
            let mut cfg = Config::default_config()?;
            cfg.registry_preload = false;
            let mut pm = PackageManager::new(cfg).await?;
            pm.update_registry().await
        }
        Commands::Validate { path } => cmd_validate(path).await,
        Commands::Context { command } => cmd_context(command).await,
        Commands::Version => {
            println!("cardano-up version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn cmd_list_available(all_versions: bool) -> cardano_up::Result<()> {
    let pm = PackageManager::new_default().await?;
    let mut packages = pm.available_packages();
    if !all_versions {
        // Keep only the greatest version per package name
        let mut latest: Vec<cardano_up::Package> = Vec::new();
        for pkg in packages {
            let version = cardano_up::parse_version(&pkg.version)?;
            match latest.iter_mut().find(|p| p.name == pkg.name) {
                Some(existing) => {
                    if version > cardano_up::parse_version(&existing.version)? {
                        *existing = pkg;
                    }
                }
                None => latest.push(pkg),
            }
        }
        packages = latest;
    }
    let mut output = "Available packages:\n\n".to_string();
    for pkg in packages {
        output.push_str(&format!(
            "{} ({})    {}\n",
            pkg.name, pkg.version, pkg.description
        ));
    }
    info!("{}", output);
    Ok(())
}

async fn cmd_list(all_contexts: bool) -> cardano_up::Result<()> {
    let pm = PackageManager::new_default().await?;
    let packages = if all_contexts {
        pm.installed_packages_all_contexts().to_vec()
    } else {
        pm.installed_packages()
    };
    let mut output = "Installed packages:\n\n".to_string();
    output.push_str(&format!(
        "{:<25} {:<12} {:<15} {}\n",
        "Name", "Version", "Context", "Installed"
    ));
    for pkg in packages {
        output.push_str(&format!(
            "{:<25} {:<12} {:<15} {}\n",
            pkg.package.name,
            pkg.package.version,
            pkg.context,
            pkg.installed_time.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    info!("{}", output);
    Ok(())
}

async fn cmd_install(package: String, network: Option<String>) -> cardano_up::Result<()> {
    let mut pm = PackageManager::new_default().await?;
    let (context_name, context) = pm.active_context();
    if context.network.is_empty() {
        // Set the requested network (or the default) on first install
        let network = network.unwrap_or_else(|| "preprod".to_string());
        let mut updated = context;
        updated.network = network.clone();
        pm.update_context(&context_name, updated)?;
        debug!("set active context network to {:?}", network);
    } else if let Some(network) = network
        && network != context.network
    {
        error!(
            "active context already has network {:?}, cannot set to {:?}",
            context.network, network
        );
        return Err(Error::ContextNoChangeNetwork);
    }
    pm.install(&[package]).await
}

async fn cmd_validate(path: Option<PathBuf>) -> cardano_up::Result<()> {
    let packages_dir = path.unwrap_or_else(|| PathBuf::from("."));
    let packages_dir = std::fs::canonicalize(&packages_dir)?;
    let mut cfg = Config::default_config()?;
    cfg.registry_dir = Some(packages_dir.clone());
    // Skip preload so problems are only reported by the validation pass
    cfg.registry_preload = false;
    let pm = PackageManager::new(cfg).await?;
    info!("Validating packages in path {}", packages_dir.display());
    pm.validate_packages()?;
    info!("No problems found!");
    Ok(())
}

async fn cmd_context(command: ContextCommands) -> cardano_up::Result<()> {
    match command {
        ContextCommands::List => {
            let pm = PackageManager::new_default().await?;
            let (active, _) = pm.active_context();
            let mut output = "Contexts (* is active):\n\n".to_string();
            output.push_str(&format!(
                "  {:<15} {:<15} {}\n",
                "Name", "Network", "Description"
            ));
            for (name, context) in pm.contexts() {
                let marker = if *name == active { "*" } else { " " };
                output.push_str(&format!(
                    "{} {:<15} {:<15} {}\n",
                    marker, name, context.network, context.description
                ));
            }
            info!("{}", output);
            Ok(())
        }
        ContextCommands::Select { name } => {
            let mut pm = PackageManager::new_default().await?;
            pm.set_active_context(&name).await?;
            info!("Selected context {:?}", name);
            Ok(())
        }
        ContextCommands::Create {
            name,
            description,
            network,
        } => {
            let mut pm = PackageManager::new_default().await?;
            pm.add_context(
                &name,
                Context {
                    description: description.unwrap_or_default(),
                    network: network.unwrap_or_default(),
                    network_magic: 0,
                },
            )?;
            info!("Created context {:?}", name);
            Ok(())
        }
        ContextCommands::Delete { name, force } => cmd_context_delete(name, force).await,
        ContextCommands::Env => {
            let pm = PackageManager::new_default().await?;
            let mut output = String::new();
            for (key, value) in pm.context_env() {
                output.push_str(&format!("export {key}={value}\n"));
            }
            info!("{}", output);
            Ok(())
        }
    }
}

async fn cmd_context_delete(name: String, force: bool) -> cardano_up::Result<()> {
    let mut pm = PackageManager::new_default().await?;
    let (orig_context, _) = pm.active_context();
    // Make sure we're not deleting the active context
    if name == orig_context {
        return Err(Error::ContextNoDeleteActive);
    }
    // Temporarily switch to the doomed context to find its packages
    pm.set_active_context(&name).await?;
    let installed = pm.installed_packages();
    if !installed.is_empty() {
        if !force {
            if let Err(e) = pm.set_active_context(&orig_context).await {
                warn!("{}", e);
            }
            error!(
                "cannot delete context with packages installed. Uninstall packages or run with -f/--force"
            );
            return Err(Error::OperationFailed);
        }
        for pkg in installed {
            if let Err(e) = pm.uninstall(&pkg.package.name, false, true).await {
                warn!("{}", e);
            }
        }
    }
    pm.set_active_context(&orig_context).await?;
    pm.delete_context(&name)?;
    info!("Deleted context {:?}", name);
    Ok(())
}
