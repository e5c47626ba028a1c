//! Version resolution for installs, upgrades, and uninstalls.
//!
//! The resolver holds the installed set for a context and the available
//! manifests, and answers three questions:
//!
//! - which packages (and one level of dependencies) to install,
//! - which versions an upgrade should move to,
//! - whether an uninstall would break a sibling's dependency.
//!
//! On construction it accumulates version constraints from every installed
//! package's dependency specs, so later selections never pick a version a
//! neighbour cannot live with.
//!
//! ## Dependency Spec Grammar
//!
//! ```text
//! name ( '[' option ( ',' option )* ']' )? ( constraint ( ',' constraint )* )?
//! ```
//!
//! Options prefixed `-` are false. Constraints use the operators `<`,
//! `<=`, `=`, `>=`, `>`, `~>`, `!=`; a bare version means equality.
//! Whitespace between tokens is permitted.

use crate::error::{Error, Result};
use crate::package::{InstalledPackage, Package};
use semver::Version;
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Versions
// =============================================================================

/// Parses a version leniently: missing minor/patch segments are padded
/// with zeros so `1.2` and `1` are accepted.
pub fn parse_version(version: &str) -> Result<Version> {
    let version = version.trim();
    if let Ok(v) = Version::parse(version) {
        return Ok(v);
    }
    let parts: Vec<&str> = version.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return Err(Error::InvalidVersion(version.to_string()));
    }
    let segment = |idx: usize| parts.get(idx).and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok(Version::new(segment(0), segment(1), segment(2)))
}

/// Comparison operator in a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstraintOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
    /// `~>`: at least the given version, below the next significant bump.
    Pessimistic,
}

/// A single parsed version constraint.
#[derive(Debug, Clone)]
pub struct Constraint {
    op: ConstraintOp,
    version: Version,
    /// How many segments the written version had; drives the `~>` bound.
    segments: usize,
}

impl Constraint {
    /// Parses one constraint like `>= 1.2.3` or a bare version.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (op, rest) = if let Some(rest) = raw.strip_prefix("<=") {
            (ConstraintOp::Le, rest)
        } else if let Some(rest) = raw.strip_prefix(">=") {
            (ConstraintOp::Ge, rest)
        } else if let Some(rest) = raw.strip_prefix("!=") {
            (ConstraintOp::Ne, rest)
        } else if let Some(rest) = raw.strip_prefix("~>") {
            (ConstraintOp::Pessimistic, rest)
        } else if let Some(rest) = raw.strip_prefix('<') {
            (ConstraintOp::Lt, rest)
        } else if let Some(rest) = raw.strip_prefix('>') {
            (ConstraintOp::Gt, rest)
        } else if let Some(rest) = raw.strip_prefix('=') {
            (ConstraintOp::Eq, rest)
        } else {
            (ConstraintOp::Eq, raw)
        };
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(Error::InvalidVersionConstraint(raw.to_string()));
        }
        let version = parse_version(rest)
            .map_err(|_| Error::InvalidVersionConstraint(raw.to_string()))?;
        Ok(Self {
            op,
            version,
            segments: rest.split('.').count(),
        })
    }

    /// Whether a version satisfies this constraint.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        match self.op {
            ConstraintOp::Lt => version < &self.version,
            ConstraintOp::Le => version <= &self.version,
            ConstraintOp::Eq => version == &self.version,
            ConstraintOp::Ge => version >= &self.version,
            ConstraintOp::Gt => version > &self.version,
            ConstraintOp::Ne => version != &self.version,
            ConstraintOp::Pessimistic => {
                version >= &self.version && version < &self.pessimistic_upper()
            }
        }
    }

    fn pessimistic_upper(&self) -> Version {
        match self.segments {
            // ~>1.2.3 allows 1.2.x and up within 1.x
            3 => Version::new(self.version.major, self.version.minor + 1, 0),
            2 => Version::new(self.version.major + 1, 0, 0),
            _ => Version::new(self.version.major + 1, 0, 0),
        }
    }
}

/// Parses a comma-separated constraint list. Empty input is no constraint.
pub fn parse_constraints(spec: &str) -> Result<Vec<Constraint>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    spec.split(',').map(Constraint::parse).collect()
}

fn check_all(constraints: &[Constraint], version: &Version) -> bool {
    constraints.iter().all(|c| c.matches(version))
}

fn constraints_display(constraints: &[Constraint]) -> String {
    constraints
        .iter()
        .map(|c| format!("{:?} {}", c.op, c.version))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Dependency Specs
// =============================================================================

/// Splits `name[opts]constraints` into its parts.
///
/// Returns `(name, version-spec, options)`. Malformed option brackets are
/// left in the name, matching the lenient grammar.
#[must_use]
pub fn split_package(pkg: &str) -> (String, String, BTreeMap<String, bool>) {
    let mut name = String::new();
    let mut opts = BTreeMap::new();
    // Extract any package option flags
    if let (Some(open), Some(close)) = (pkg.find('['), pkg.find(']'))
        && open > 0
        && close > open
    {
        name = pkg[..open].to_string();
        for flag in pkg[open + 1..close].split(',') {
            match flag.strip_prefix('-') {
                Some(flag) => opts.insert(flag.to_string(), false),
                None => opts.insert(flag.to_string(), true),
            };
        }
    }
    // Extract version spec
    let mut version_spec = String::new();
    if let Some(idx) = pkg.find([' ', '<', '>', '=', '~', '!'])
        && idx > 0
    {
        if name.is_empty() {
            name = pkg[..idx].to_string();
        }
        version_spec = pkg[idx..].trim().to_string();
    }
    if name.is_empty() {
        name = pkg.to_string();
    }
    (name, version_spec, opts)
}

// =============================================================================
// Resolver
// =============================================================================

/// One element of an install plan.
#[derive(Debug, Clone)]
pub struct InstallSet {
    pub install: Package,
    pub options: BTreeMap<String, bool>,
    /// True for the user-selected package; false for dependencies.
    pub selected: bool,
}

/// One element of an upgrade plan.
#[derive(Debug, Clone)]
pub struct UpgradeSet {
    /// The currently installed record, when one exists.
    pub installed: Option<InstalledPackage>,
    pub upgrade: Package,
    pub options: BTreeMap<String, bool>,
}

/// Computes install/upgrade/uninstall plans subject to constraints.
pub struct Resolver {
    context: String,
    installed: Vec<InstalledPackage>,
    available: Vec<Package>,
    installed_constraints: BTreeMap<String, Vec<Constraint>>,
}

impl Resolver {
    /// Builds a resolver, accumulating constraints from installed packages.
    pub fn new(
        installed: Vec<InstalledPackage>,
        available: Vec<Package>,
        context: &str,
    ) -> Result<Self> {
        let mut installed_constraints: BTreeMap<String, Vec<Constraint>> = BTreeMap::new();
        for installed_pkg in &installed {
            for dep in &installed_pkg.package.dependencies {
                let (dep_name, dep_spec, _) = split_package(dep);
                let constraints = parse_constraints(&dep_spec)?;
                if constraints.is_empty() {
                    continue;
                }
                debug!(
                    "added constraint for installed package {:?} dependency {:?}: {}",
                    installed_pkg.package.name,
                    dep_name,
                    constraints_display(&constraints)
                );
                installed_constraints
                    .entry(dep_name)
                    .or_default()
                    .extend(constraints);
            }
        }
        Ok(Self {
            context: context.to_string(),
            installed,
            available,
            installed_constraints,
        })
    }

    /// Plans an install: dependencies first, the selected package last.
    pub fn install(&self, pkgs: &[String]) -> Result<Vec<InstallSet>> {
        let mut plan = Vec::new();
        for pkg in pkgs {
            let (name, version_spec, opts) = split_package(pkg);
            if self.find_installed(&name, "")?.is_some() {
                return Err(Error::PackageAlreadyInstalled(name));
            }
            let latest = self
                .latest_available(&name, &version_spec)?
                .ok_or_else(|| Error::NoAvailablePackage(pkg.clone()))?;
            plan.extend(self.needed_deps(&latest)?);
            plan.push(InstallSet {
                install: latest,
                options: opts,
                selected: true,
            });
        }
        Ok(plan)
    }

    /// Plans an upgrade, carrying any newly required dependencies along.
    pub fn upgrade(&self, pkgs: &[String]) -> Result<Vec<UpgradeSet>> {
        let mut plan = Vec::new();
        for pkg in pkgs {
            let (name, version_spec, opts) = split_package(pkg);
            let installed = self
                .find_installed(&name, "")?
                .ok_or_else(|| Error::PackageNotInstalled {
                    name: name.clone(),
                    context: self.context.clone(),
                })?
                .clone();
            let latest = self.latest_available(&name, &version_spec)?;
            let latest = match latest {
                Some(pkg) if pkg.version != installed.package.version => pkg,
                _ => return Err(Error::NoPackageAvailableForUpgrade(pkg.clone())),
            };
            let deps = self.needed_deps(&latest)?;
            plan.push(UpgradeSet {
                installed: Some(installed),
                upgrade: latest,
                options: opts,
            });
            for dep in deps {
                let dep_installed = self.find_installed(&dep.install.name, "")?.cloned();
                plan.push(UpgradeSet {
                    installed: dep_installed,
                    upgrade: dep.install,
                    options: dep.options,
                });
            }
        }
        Ok(plan)
    }

    /// Fails when removing any of the given packages would leave another
    /// installed package's dependency constraint unmet.
    pub fn uninstall(&self, pkgs: &[InstalledPackage]) -> Result<()> {
        for pkg in pkgs {
            let pkg_version = parse_version(&pkg.package.version)?;
            for installed in &self.installed {
                for dep in &installed.package.dependencies {
                    let (dep_name, dep_spec, _) = split_package(dep);
                    if pkg.package.name != dep_name {
                        continue;
                    }
                    let constraints = parse_constraints(&dep_spec)?;
                    if !constraints.is_empty() && !check_all(&constraints, &pkg_version) {
                        continue;
                    }
                    return Err(Error::UninstallWouldBreakDeps {
                        name: pkg.package.name.clone(),
                        version: pkg.package.version.clone(),
                        dependent: installed.package.name.clone(),
                        dependent_version: installed.package.version.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// One level of dependency expansion for a chosen package.
    ///
    /// Transitive dependencies of dependencies are not expanded; manifests
    /// keep their dependency lists flat.
    fn needed_deps(&self, pkg: &Package) -> Result<Vec<InstallSet>> {
        let mut deps = Vec::new();
        for dep in &pkg.dependencies {
            let (dep_name, dep_spec, dep_opts) = split_package(dep);
            // An installed package satisfying the constraint wins outright
            if self.find_installed(&dep_name, &dep_spec)?.is_some() {
                continue;
            }
            if let Some(mismatched) = self.find_installed(&dep_name, "")? {
                return Err(Error::InstalledPackageNoMatchVersionSpec {
                    name: mismatched.package.name.clone(),
                    version: mismatched.package.version.clone(),
                    dependency: dep.clone(),
                });
            }
            let candidates = self.find_available(&dep_name, &dep_spec)?;
            if candidates.is_empty() {
                return Err(Error::NoAvailablePackageDependency(dep.clone()));
            }
            let latest = latest_package(&candidates)?
                .ok_or_else(|| Error::NoAvailablePackageDependency(dep.clone()))?;
            deps.push(InstallSet {
                install: latest,
                options: dep_opts,
                selected: false,
            });
        }
        Ok(deps)
    }

    fn find_installed(
        &self,
        name: &str,
        version_spec: &str,
    ) -> Result<Option<&InstalledPackage>> {
        let constraints = parse_constraints(version_spec)?;
        for installed in &self.installed {
            if installed.package.name != name {
                continue;
            }
            if !constraints.is_empty() {
                let version = parse_version(&installed.package.version)?;
                if !check_all(&constraints, &version) {
                    continue;
                }
            }
            return Ok(Some(installed));
        }
        Ok(None)
    }

    /// Available packages matching a name, the requested spec, and the
    /// constraints accumulated from installed packages.
    fn find_available(&self, name: &str, version_spec: &str) -> Result<Vec<Package>> {
        let mut constraints = parse_constraints(version_spec)?;
        if let Some(installed) = self.installed_constraints.get(name) {
            constraints.extend(installed.iter().cloned());
        }
        let mut candidates = Vec::new();
        for available in &self.available {
            if available.name != name {
                continue;
            }
            if !constraints.is_empty() {
                let version = parse_version(&available.version)?;
                if !check_all(&constraints, &version) {
                    debug!(
                        "excluding available package \"{} = {}\" due to constraint: {}",
                        available.name,
                        available.version,
                        constraints_display(&constraints)
                    );
                    continue;
                }
            }
            candidates.push(available.clone());
        }
        Ok(candidates)
    }

    fn latest_available(&self, name: &str, version_spec: &str) -> Result<Option<Package>> {
        let candidates = self.find_available(name, version_spec)?;
        latest_package(&candidates)
    }
}

/// Greatest-version element of a candidate list.
fn latest_package(pkgs: &[Package]) -> Result<Option<Package>> {
    let mut latest: Option<(Version, &Package)> = None;
    for pkg in pkgs {
        let version = parse_version(&pkg.version)?;
        let newer = match &latest {
            Some((best, _)) => version > *best,
            None => true,
        };
        if newer {
            latest = Some((version, pkg));
        }
    }
    Ok(latest.map(|(_, pkg)| pkg.clone()))
}
