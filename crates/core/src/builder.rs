//! Offline manifest builder: walks a build output tree and produces the
//! `project.manifest` / `version.manifest` pair consumed by the updater.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{
    manifest::{AssetEntry, Manifest, PROJECT_MANIFEST, VERSION_MANIFEST},
    verify,
};

/// Directory names never included in a manifest.
const SKIP_DIRS: &[&str] = &[".git", ".svn", "node_modules"];

/// File names never included in a manifest.
const SKIP_FILES: &[&str] = &[PROJECT_MANIFEST, VERSION_MANIFEST, ".DS_Store", "Thumbs.db"];

/// Extensions never included: engine metadata sidecars and any manifest.
const SKIP_EXTENSIONS: &[&str] = &[".meta", ".manifest"];

/// File extensions flagged as compressed archives in the manifest.
const COMPRESSED_EXTENSIONS: &[&str] = &[".zip"];

/// Inputs for a manifest build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Root of the build output tree to scan.
    pub source_root: PathBuf,
    /// Version string to stamp into both manifests.
    pub version: String,
    /// Base URL the assets will be served from. A trailing slash is added
    /// if missing.
    pub base_url: String,
    /// Engine compatibility tag stamped into both manifests.
    pub engine_version: String,
}

impl BuildOptions {
    /// Options with the default engine version tag.
    pub fn new(
        source_root: impl Into<PathBuf>,
        version: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            version: version.into(),
            base_url: base_url.into(),
            engine_version: "3.8.0".to_string(),
        }
    }

    fn normalized_base_url(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        format!("{trimmed}/")
    }
}

/// Scan the source tree and produce the full manifest.
///
/// Every file that survives the exclusion rules contributes its relative
/// path (separators normalized to `/`), content digest, byte size and a
/// compressed flag derived from the extension. Output content is
/// deterministic for an unchanged tree; map ordering is not significant.
pub fn build(options: &BuildOptions) -> Result<Manifest> {
    if !options.source_root.is_dir() {
        bail!(
            "source root {} does not exist",
            options.source_root.display()
        );
    }

    let base_url = options.normalized_base_url();
    let mut assets = HashMap::new();

    for entry in WalkDir::new(&options.source_root)
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry))
    {
        let entry = entry.context("failed to walk source tree")?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if is_skipped_file(&name) {
            debug!(file = %name, "skipping excluded file");
            continue;
        }

        let rel_path = relative_asset_path(&options.source_root, entry.path())?;
        let size = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?
            .len();
        let md5 = verify::checksum_file(entry.path())
            .with_context(|| format!("failed to hash {}", entry.path().display()))?;

        assets.insert(
            rel_path,
            AssetEntry {
                md5,
                size,
                compressed: is_compressed(&name),
            },
        );
    }

    info!(
        assets = assets.len(),
        version = %options.version,
        "manifest build complete"
    );

    Ok(Manifest {
        package_url: base_url.clone(),
        remote_manifest_url: format!("{base_url}{PROJECT_MANIFEST}"),
        remote_version_url: format!("{base_url}{VERSION_MANIFEST}"),
        version: options.version.clone(),
        engine_version: options.engine_version.clone(),
        assets,
        search_paths: Vec::new(),
    })
}

/// Write the full and version-only manifests into `dest_dir`, creating the
/// directory if needed.
pub fn write_manifests(manifest: &Manifest, dest_dir: impl AsRef<Path>) -> Result<()> {
    let dest_dir = dest_dir.as_ref();
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;

    manifest.persist(dest_dir.join(PROJECT_MANIFEST))?;
    manifest
        .version_manifest()
        .persist(dest_dir.join(VERSION_MANIFEST))
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIP_DIRS.contains(&name))
            .unwrap_or(false)
}

fn is_skipped_file(name: &str) -> bool {
    SKIP_FILES.contains(&name) || SKIP_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

fn is_compressed(name: &str) -> bool {
    COMPRESSED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

fn relative_asset_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside the source root", path.display()))?;
    let components: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(components.join("/"))
}
