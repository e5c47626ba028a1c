//! Constants for the package manager.
//!
//! All file names, timeouts, and defaults are defined here to ensure
//! consistency and prevent magic values throughout the codebase.

use std::time::Duration;

// =============================================================================
// State Files
// =============================================================================

/// Contexts state file (under the config dir).
pub const CONTEXTS_FILENAME: &str = "contexts.yaml";

/// Active context state file.
pub const ACTIVE_CONTEXT_FILENAME: &str = "active_context.yaml";

/// Installed packages state file.
pub const INSTALLED_PACKAGES_FILENAME: &str = "installed_packages.yaml";

/// Host port registry state file.
pub const PORT_REGISTRY_FILENAME: &str = "port_registry.yaml";

/// Name of the context created when no state exists yet.
pub const DEFAULT_CONTEXT_NAME: &str = "default";

// =============================================================================
// Directories
// =============================================================================

/// Program name, used as the per-user subdirectory for config/cache/data.
pub const PROGRAM_NAME: &str = "cardano-up";

/// Subdirectory of the cache dir holding the extracted registry archive.
pub const REGISTRY_CACHE_DIR: &str = "registry";

// =============================================================================
// Registry
// =============================================================================

/// Default package registry archive.
pub const DEFAULT_REGISTRY_URL: &str =
    "https://github.com/blinklabs-io/cardano-up-packages/archive/refs/heads/main.zip";

/// Age after which the extracted registry cache is considered stale.
pub const REGISTRY_CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Timeout for the registry archive download.
pub const REGISTRY_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Containers
// =============================================================================

/// Grace period passed to the engine when stopping a container.
pub const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Restart policy applied to every created service container.
pub const CONTAINER_RESTART_POLICY: &str = "unless-stopped";

/// Default Docker Engine API socket when `DOCKER_HOST` is unset.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Docker Engine API version prefix used for all requests.
pub const DOCKER_API_VERSION: &str = "v1.43";

// =============================================================================
// Files
// =============================================================================

/// Mode for state files written to the config dir.
pub const STATE_FILE_MODE: u32 = 0o600;

/// Mode for the config dir itself.
pub const STATE_DIR_MODE: u32 = 0o700;

/// Mode for installed files when the manifest does not specify one.
pub const DEFAULT_FILE_MODE: u32 = 0o755;
