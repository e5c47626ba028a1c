//! Host port allocation and the persistent port registry.
//!
//! Docker install steps declare ports as `[ip:][hp:]cp[/proto]` specs. When
//! the host port is omitted, the allocator picks one: a port remembered from
//! a previous install of the same package (so upgrades keep their bindings),
//! or a fresh ephemeral port probed from the kernel.
//!
//! ## Registry Model
//!
//! Allocations are remembered per `(context, package, service, container
//! port)` in a nested mapping persisted by the state store:
//!
//! ```text
//! context → package → service → container-port → host-port
//! ```
//!
//! ## Ephemeral Allocation
//!
//! The probe binds a transient listener on `127.0.0.1:0`, reads the
//! kernel-assigned port, and closes it. The port is not reserved: the caller
//! creates the container immediately afterwards, so the race window is small
//! but nonzero. The engine's own bind failure is the backstop.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{TcpListener, UdpSocket};

// =============================================================================
// Registry Types
// =============================================================================

/// Container-port → host-port mappings for one service.
pub type ServicePortMap = BTreeMap<String, String>;

/// Service-name → port mappings for one package.
pub type PackagePortRegistry = BTreeMap<String, ServicePortMap>;

/// Package-name → service mappings for one context.
pub type ContextPortRegistry = BTreeMap<String, PackagePortRegistry>;

/// Context-name → package mappings. The root persisted structure.
pub type PortRegistry = BTreeMap<String, ContextPortRegistry>;

// =============================================================================
// Protocol
// =============================================================================

/// Network protocol for a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (the default when a spec has no `/proto` suffix).
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

// =============================================================================
// Port Spec
// =============================================================================

/// A parsed `[ip:][hp:]cp[/proto]` port specification.
///
/// The protocol is `None` when the spec had no `/proto` suffix so that
/// re-serialization preserves the input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Host IP to bind, when given.
    pub host_ip: Option<String>,
    /// Host port, when given.
    pub host_port: Option<String>,
    /// Container port. May be empty for degenerate specs, which pass
    /// through the allocator unchanged.
    pub container_port: String,
    /// Explicit protocol suffix, when given.
    pub protocol: Option<Protocol>,
}

impl PortSpec {
    /// Parses a port spec. Port ranges are rejected.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPortSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (ports_part, protocol) = match spec.rsplit_once('/') {
            Some((ports, proto)) => {
                let protocol =
                    Protocol::parse(proto).ok_or_else(|| invalid("unknown protocol"))?;
                (ports, Some(protocol))
            }
            None => (spec, None),
        };
        let parts: Vec<&str> = ports_part.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [cp] => (None, None, *cp),
            [hp, cp] => (None, Some(*hp), *cp),
            [ip, hp, cp] => (Some(*ip), Some(*hp), *cp),
            _ => return Err(invalid("too many separators")),
        };
        if container_port.contains('-') || host_port.is_some_and(|hp| hp.contains('-')) {
            return Err(invalid("port ranges are not supported"));
        }
        if !container_port.is_empty() && container_port.parse::<u16>().is_err() {
            return Err(invalid("container port is not a valid port number"));
        }
        if let Some(hp) = host_port
            && !hp.is_empty()
            && hp.parse::<u16>().is_err()
        {
            return Err(invalid("host port is not a valid port number"));
        }
        Ok(Self {
            host_ip: host_ip.map(str::to_string),
            host_port: host_port
                .filter(|hp| !hp.is_empty())
                .map(str::to_string),
            container_port: container_port.to_string(),
            protocol,
        })
    }

    /// Effective protocol, defaulting to TCP.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol.unwrap_or(Protocol::Tcp)
    }

    /// Re-serializes as `[ip:][hp:]cp[/proto]`.
    ///
    /// The host-port separator is included whenever an IP or host port is
    /// present, matching the parse shape.
    #[must_use]
    pub fn to_spec_string(&self) -> String {
        let mut out = String::new();
        if let Some(ip) = &self.host_ip {
            out.push_str(ip);
            out.push(':');
        }
        if let Some(hp) = &self.host_port {
            out.push_str(hp);
            out.push(':');
        } else if self.host_ip.is_some() {
            out.push(':');
        }
        out.push_str(&self.container_port);
        if let Some(proto) = self.protocol {
            out.push('/');
            out.push_str(&proto.to_string());
        }
        out
    }
}

/// Splits an already-bound port string into `(host-port, container-port)`.
///
/// Used when reading ports back from running services for display and for
/// the `.Ports` template namespace. A bare `cp` maps to itself.
#[must_use]
pub fn split_host_container(port: &str) -> (String, String) {
    let ports_part = port.rsplit_once('/').map_or(port, |(p, _)| p);
    let parts: Vec<&str> = ports_part.split(':').collect();
    match parts.as_slice() {
        [cp] => ((*cp).to_string(), (*cp).to_string()),
        [hp, cp] => ((*hp).to_string(), (*cp).to_string()),
        [_, hp, cp] => ((*hp).to_string(), (*cp).to_string()),
        _ => (String::new(), String::new()),
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// Probes the kernel for a free ephemeral port.
///
/// Best-effort: the transient socket is closed before the caller binds the
/// port for real, so another process can steal it in between.
pub fn ephemeral_port(protocol: Protocol) -> Result<u16> {
    let port = match protocol {
        Protocol::Tcp => TcpListener::bind(("127.0.0.1", 0))?.local_addr()?.port(),
        Protocol::Udp => UdpSocket::bind(("127.0.0.1", 0))?.local_addr()?.port(),
    };
    Ok(port)
}

/// Decides the final host-port binding for one port spec.
///
/// Precedence for a missing host port: the `remembered` mapping for this
/// container port, then a fresh ephemeral port. Every chosen host port is
/// recorded in `allocated` (first write wins) so the caller can persist the
/// bindings used by this install.
pub fn allocate_host_port(
    spec: &str,
    remembered: &ServicePortMap,
    allocated: &mut ServicePortMap,
) -> Result<String> {
    let mut parsed = PortSpec::parse(spec)?;
    if parsed.container_port.is_empty() {
        return Ok(spec.to_string());
    }
    let host_port = match &parsed.host_port {
        Some(hp) => hp.clone(),
        None => match remembered.get(&parsed.container_port) {
            Some(hp) => {
                tracing::debug!(
                    "reusing remembered host port {} for container port {}",
                    hp,
                    parsed.container_port
                );
                hp.clone()
            }
            None => ephemeral_port(parsed.protocol())?.to_string(),
        },
    };
    allocated
        .entry(parsed.container_port.clone())
        .or_insert_with(|| host_port.clone());
    parsed.host_port = Some(host_port);
    Ok(parsed.to_spec_string())
}
