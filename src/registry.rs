//! Package registry loading.
//!
//! The registry is simply a tree of manifest files: every `*.yaml`/`*.yml`
//! under the registry directory is parsed as a package. The directory can
//! be local (`REGISTRY_DIR`) or populated from a remote ZIP archive that is
//! cached for a day under the user cache dir.
//!
//! Listing is lenient: files that fail to parse are logged and skipped so a
//! broken manifest cannot take out the whole registry. The explicit
//! validation pass is the strict counterpart, collecting every problem and
//! failing once at the end.
//!
//! ## Archive Safety
//!
//! Archive entries are extracted through their sanitised names; an entry
//! whose path would escape the extraction root fails the whole fetch.

use crate::config::Config;
use crate::constants::{REGISTRY_CACHE_DIR, REGISTRY_CACHE_MAX_AGE, REGISTRY_FETCH_TIMEOUT};
use crate::error::{Error, Result};
use crate::package::Package;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Produces the available package manifests from the configured source.
pub async fn available_packages(cfg: &Config) -> Result<Vec<Package>> {
    if let Some(dir) = &cfg.registry_dir {
        packages_from_dir(dir)
    } else if !cfg.registry_url.is_empty() {
        packages_from_url(cfg).await
    } else {
        Err(Error::NoRegistryConfigured)
    }
}

/// Removes the cached registry extraction, forcing the next load to fetch.
pub fn clear_cache(cfg: &Config) -> Result<()> {
    let cache_path = cfg.cache_dir.join(REGISTRY_CACHE_DIR);
    match std::fs::remove_dir_all(&cache_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Walks a registry directory, parsing manifests leniently.
///
/// A missing directory is an empty registry.
pub fn packages_from_dir(dir: &Path) -> Result<Vec<Package>> {
    let mut packages = Vec::new();
    if !dir.exists() {
        return Ok(packages);
    }
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // Skip dot-dirs (e.g. .git in a checked-out registry)
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && entry.file_name().to_string_lossy().starts_with('.'))
        });
    for entry in walker {
        let entry = entry.map_err(|e| Error::Archive(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        if ext != "yaml" && ext != "yml" {
            continue;
        }
        let pkg = match Package::from_file(entry.path()) {
            Ok(pkg) => pkg,
            Err(e) => {
                warn!("failed to load {:?} as package: {}", entry.path(), e);
                continue;
            }
        };
        if pkg.name.is_empty() || pkg.version.is_empty() {
            continue;
        }
        packages.push(pkg);
    }
    Ok(packages)
}

/// Fetches (or reuses) the remote registry archive, then scans the cache.
async fn packages_from_url(cfg: &Config) -> Result<Vec<Package>> {
    let cache_path = cfg.cache_dir.join(REGISTRY_CACHE_DIR);
    if cache_stale(&cache_path) {
        info!("Fetching package registry {}", cfg.registry_url);
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_FETCH_TIMEOUT)
            .build()?;
        let body = client
            .get(&cfg.registry_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        extract_archive(&body, &cache_path)?;
    }
    packages_from_dir(&cache_path)
}

fn cache_stale(cache_path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(cache_path) else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return true;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > REGISTRY_CACHE_MAX_AGE,
        // Future mtime: treat as fresh
        Err(_) => false,
    }
}

/// Extracts a registry ZIP into the cache path, replacing any previous
/// extraction.
fn extract_archive(data: &[u8], cache_path: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data))
        .map_err(|e| Error::Archive(e.to_string()))?;
    // Clear out existing cache files
    match std::fs::remove_dir_all(cache_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(cache_path)?;
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| Error::Archive(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        // enclosed_name refuses entries that would escape the root
        let relative: PathBuf = file.enclosed_name().ok_or_else(|| {
            Error::Archive(format!(
                "archive entry escapes extraction root: {:?}",
                file.name()
            ))
        })?;
        let out_path = cache_path.join(relative);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        std::fs::write(&out_path, contents)?;
    }
    Ok(())
}

/// Strictly validates every manifest in a directory.
///
/// Problems are collected per file and reported as one aggregated failure.
pub fn validate_packages(cfg: &Config, dir: &Path) -> Result<()> {
    let mut problems = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Archive(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        if ext != "yaml" && ext != "yml" {
            continue;
        }
        match Package::from_file(entry.path()) {
            Ok(pkg) => {
                if let Err(e) = pkg.validate(cfg) {
                    problems.push(format!("{}: {}", entry.path().display(), e));
                }
            }
            Err(e) => problems.push(format!("{}: {}", entry.path().display(), e)),
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::ValidationFailed { problems })
    }
}
