//! Error types for the package manager.

/// Result type alias for package manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the package manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Composite
    // =========================================================================
    /// Operation failed; details were already reported through the logger.
    #[error("the operation has failed")]
    OperationFailed,

    // =========================================================================
    // Install Steps
    // =========================================================================
    /// More than one install method given on a single install step.
    #[error("only one install method may be specified in an install step")]
    MultipleInstallMethods,

    /// No recognized install method given on an install step.
    #[error("no supported install method specified on install step")]
    NoInstallMethods,

    /// An install step condition failed to evaluate.
    #[error("failure evaluating install step condition {condition:?}: {reason}")]
    InstallStepCondition { condition: String, reason: String },

    // =========================================================================
    // Contexts
    // =========================================================================
    /// Context does not exist.
    #[error("context does not exist")]
    ContextNotExist,

    /// Context name already in use.
    #[error("specified context already exists")]
    ContextAlreadyExists,

    /// Context network is immutable once set.
    #[error("cannot change the network for a context once set")]
    ContextNoChangeNetwork,

    /// Install requires the active context to have a network.
    #[error("no network specified for active context")]
    ContextInstallNoNetwork,

    /// The active context cannot be deleted.
    #[error("cannot delete active context")]
    ContextNoDeleteActive,

    /// Network name not known.
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    // =========================================================================
    // Containers
    // =========================================================================
    /// A container with the computed name already exists on the host.
    #[error("specified container already exists")]
    ContainerAlreadyExists,

    /// Expected container was not found on the host.
    #[error("specified container does not exist")]
    ContainerNotExists,

    /// Container engine unreachable or request failed.
    #[error("container runtime error: {0}")]
    ContainerRuntime(String),

    // =========================================================================
    // Registry
    // =========================================================================
    /// Neither a registry URL nor a registry dir was configured.
    #[error("no package registry is configured")]
    NoRegistryConfigured,

    /// Package validation found problems; each is listed on its own line.
    #[error("package validation failed:\n{}", problems.join("\n"))]
    ValidationFailed { problems: Vec<String> },

    // =========================================================================
    // Resolver
    // =========================================================================
    /// Package is already installed in the current context.
    #[error(
        "package {0} is already installed, please upgrade or use another context"
    )]
    PackageAlreadyInstalled(String),

    /// Package is not installed in the given context.
    #[error("package {name} is not installed in context {context:?}")]
    PackageNotInstalled { name: String, context: String },

    /// No available package matched the request.
    #[error("no available package found for: {0}")]
    NoAvailablePackage(String),

    /// No available package satisfied a dependency.
    #[error("no available package found for dependency: {0}")]
    NoAvailablePackageDependency(String),

    /// An installed package does not match a required version spec.
    #[error(
        "installed package \"{name} = {version}\" does not match dependency: {dependency}"
    )]
    InstalledPackageNoMatchVersionSpec {
        name: String,
        version: String,
        dependency: String,
    },

    /// Uninstalling would leave another installed package's dependency unmet.
    #[error(
        "uninstalling package \"{name} = {version}\" would break dependency for package \"{dependent} = {dependent_version}\""
    )]
    UninstallWouldBreakDeps {
        name: String,
        version: String,
        dependent: String,
        dependent_version: String,
    },

    /// No newer version is available for upgrade.
    #[error("no package available for upgrade: {0}")]
    NoPackageAvailableForUpgrade(String),

    // =========================================================================
    // Services
    // =========================================================================
    /// Logs were requested for a package without any service containers.
    #[error("no services found for package {0}")]
    NoServicesFound(String),

    // =========================================================================
    // Parsing
    // =========================================================================
    /// Malformed port specification.
    #[error("invalid port spec {spec:?}: {reason}")]
    InvalidPortSpec { spec: String, reason: String },

    /// Malformed version or version constraint.
    #[error("invalid version constraint {0:?}")]
    InvalidVersionConstraint(String),

    /// Malformed package version.
    #[error("invalid package version {0:?}")]
    InvalidVersion(String),

    /// Template rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// Manifest failed to parse.
    #[error("failed to parse manifest{}: {reason}", .path.as_deref().map(|p| format!(" {p}")).unwrap_or_default())]
    ManifestParse {
        path: Option<String>,
        reason: String,
    },

    // =========================================================================
    // Hooks
    // =========================================================================
    /// A hook script failed to run or exited non-zero.
    #[error("hook script failed: {0}")]
    HookScript(String),

    // =========================================================================
    // I/O
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State file failed to parse or serialize.
    #[error("state error: {0}")]
    State(#[from] serde_yaml::Error),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Registry archive could not be read.
    #[error("registry archive error: {0}")]
    Archive(String),
}
