//! Context types.
//!
//! A context is a named environment with its own network configuration and
//! installed-package set. Multiple variants of the same package can coexist
//! by installing them into separate contexts. Exactly one context is active
//! at a time; the active context's name is persisted separately.

use serde::{Deserialize, Serialize};

/// A named environment.
///
/// The network may be set once (at creation or on the first install) and is
/// immutable afterwards. `network_magic` is derived from the network name
/// and cached so templates can reference it without a lookup.
///
/// Unknown fields are tolerated here (unlike manifests): older state files
/// embedded a `portRegistry` mapping in each context, which the state store
/// migrates out on first load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Network name (e.g. `preprod`). Empty until configured.
    #[serde(default)]
    pub network: String,
    /// Network magic number matching `network`.
    #[serde(default)]
    pub network_magic: u32,
}

impl Context {
    /// The context created when no state exists yet.
    #[must_use]
    pub fn default_context() -> Self {
        Self {
            description: "Default context".to_string(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Networks
// =============================================================================

/// Known networks and their magic numbers.
const NETWORKS: &[(&str, u32)] = &[
    ("mainnet", 764_824_073),
    ("preprod", 1),
    ("preview", 2),
    ("sanchonet", 4),
];

/// Looks up the magic number for a network name.
#[must_use]
pub fn network_magic(network: &str) -> Option<u32> {
    NETWORKS
        .iter()
        .find(|(name, _)| *name == network)
        .map(|(_, magic)| *magic)
}
