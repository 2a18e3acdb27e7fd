//! Versioned asset manifest: parsing, validation, version ordering and
//! set-difference between two manifests.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
    fs,
    path::Path,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, UpdateError};

/// File name of the full manifest, both locally and on the server.
pub const PROJECT_MANIFEST: &str = "project.manifest";
/// File name of the version-only manifest used for cheap remote polling.
pub const VERSION_MANIFEST: &str = "version.manifest";

/// Per-file record inside a manifest's asset map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    /// Lowercase hex MD5 digest of the file contents.
    pub md5: String,
    /// Size of the file in bytes.
    pub size: u64,
    /// Whether the entry is a compressed archive. Verification applies to
    /// the archive bytes as downloaded; decompression is the host's concern.
    #[serde(default)]
    pub compressed: bool,
}

/// The full asset manifest (`project.manifest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Base URL individual assets are fetched from.
    pub package_url: String,
    /// Location of the remote full manifest.
    pub remote_manifest_url: String,
    /// Location of the remote version-only manifest.
    pub remote_version_url: String,
    /// Dotted numeric version string, e.g. `"1.0.3"`.
    pub version: String,
    /// Engine compatibility tag. Informational only.
    #[serde(default)]
    pub engine_version: String,
    /// Relative path to checksum/size record for every asset in this version.
    pub assets: HashMap<String, AssetEntry>,
    /// Path prefixes to search with priority, most significant first.
    #[serde(default)]
    pub search_paths: Vec<String>,
}

/// The version-only manifest (`version.manifest`): the subset of
/// [`Manifest`] needed to decide whether a full fetch is worthwhile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionManifest {
    /// Base URL individual assets are fetched from.
    pub package_url: String,
    /// Location of the remote full manifest.
    pub remote_manifest_url: String,
    /// Location of the remote version-only manifest.
    pub remote_version_url: String,
    /// Dotted numeric version string.
    pub version: String,
    /// Engine compatibility tag.
    #[serde(default)]
    pub engine_version: String,
}

/// Difference between two manifests' asset maps, keyed by relative path.
///
/// `to_remove` is computed for completeness but the orchestrator never
/// deletes local files: sync is additive-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetDelta {
    /// Paths present only in the remote manifest.
    pub to_add: BTreeSet<String>,
    /// Paths present in both whose checksums differ.
    pub to_update: BTreeSet<String>,
    /// Paths present only in the local manifest.
    pub to_remove: BTreeSet<String>,
}

impl AssetDelta {
    /// Whether the delta contains no work at all.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// Paths that need downloading: additions plus changed files.
    pub fn to_download(&self) -> BTreeSet<String> {
        self.to_add.union(&self.to_update).cloned().collect()
    }
}

impl Manifest {
    /// Parse and validate a full manifest from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest =
            serde_json::from_slice(bytes).map_err(|err| UpdateError::ManifestParse {
                reason: err.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation beyond what serde enforces: a manifest is valid
    /// only if it carries a version and every asset entry has a checksum.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(UpdateError::ManifestParse {
                reason: "manifest version is empty".to_string(),
            });
        }
        for (path, entry) in &self.assets {
            if entry.md5.trim().is_empty() {
                return Err(UpdateError::ManifestParse {
                    reason: format!("asset {path} has an empty checksum"),
                });
            }
        }
        Ok(())
    }

    /// Compute the set-difference between a local and a remote manifest.
    ///
    /// Comparison is by path, then by checksum. Equal checksums mean the
    /// entry is unchanged even if the declared sizes disagree; a size-only
    /// mismatch points at manifest corruption and is logged rather than
    /// treated as a change.
    pub fn diff(local: &Manifest, remote: &Manifest) -> AssetDelta {
        let mut delta = AssetDelta::default();

        for (path, remote_entry) in &remote.assets {
            match local.assets.get(path) {
                None => {
                    delta.to_add.insert(path.clone());
                }
                Some(local_entry) if local_entry.md5 != remote_entry.md5 => {
                    delta.to_update.insert(path.clone());
                }
                Some(local_entry) => {
                    if local_entry.size != remote_entry.size {
                        warn!(
                            path = %path,
                            local_size = local_entry.size,
                            remote_size = remote_entry.size,
                            "asset sizes disagree but checksums match; ignoring"
                        );
                    }
                }
            }
        }

        for path in local.assets.keys() {
            if !remote.assets.contains_key(path) {
                delta.to_remove.insert(path.clone());
            }
        }

        delta
    }

    /// The version-only subset of this manifest.
    pub fn version_manifest(&self) -> VersionManifest {
        VersionManifest {
            package_url: self.package_url.clone(),
            remote_manifest_url: self.remote_manifest_url.clone(),
            remote_version_url: self.remote_version_url.clone(),
            version: self.version.clone(),
            engine_version: self.engine_version.clone(),
        }
    }

    /// Load a manifest from disk, returning `None` if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest = Manifest::parse(&contents)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Persist the manifest as pretty-printed JSON, creating parent
    /// directories if needed.
    pub fn persist(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create manifest directory {}", parent.display())
            })?;
        }

        let serialized =
            serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write manifest {}", path.display()))
    }
}

impl VersionManifest {
    /// Parse and validate a version-only manifest from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: VersionManifest =
            serde_json::from_slice(bytes).map_err(|err| UpdateError::ManifestParse {
                reason: err.to_string(),
            })?;
        if manifest.version.trim().is_empty() {
            return Err(UpdateError::ManifestParse {
                reason: "manifest version is empty".to_string(),
            });
        }
        Ok(manifest)
    }

    /// Persist the manifest as pretty-printed JSON.
    pub fn persist(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create manifest directory {}", parent.display())
            })?;
        }

        let serialized =
            serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write manifest {}", path.display()))
    }
}

/// Compare two dotted numeric version strings segment by segment.
///
/// Missing trailing segments and non-numeric segments are read as 0, so
/// `"1.2"` equals `"1.2.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|segment| segment.trim().parse().unwrap_or(0))
            .collect()
    };

    let va = parse(a);
    let vb = parse(b);
    let len = va.len().max(vb.len());

    for i in 0..len {
        let sa = va.get(i).copied().unwrap_or(0);
        let sb = vb.get(i).copied().unwrap_or(0);
        match sa.cmp(&sb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(md5: &str, size: u64) -> AssetEntry {
        AssetEntry {
            md5: md5.to_string(),
            size,
            compressed: false,
        }
    }

    fn manifest(version: &str, assets: &[(&str, AssetEntry)]) -> Manifest {
        Manifest {
            package_url: "https://example.com/remote-assets/".to_string(),
            remote_manifest_url: "https://example.com/remote-assets/project.manifest".to_string(),
            remote_version_url: "https://example.com/remote-assets/version.manifest".to_string(),
            version: version.to_string(),
            engine_version: "3.8.0".to_string(),
            assets: assets
                .iter()
                .map(|(path, entry)| (path.to_string(), entry.clone()))
                .collect(),
            search_paths: Vec::new(),
        }
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let err = Manifest::parse(br#"{"packageUrl": "x"}"#).unwrap_err();
        assert!(matches!(err, UpdateError::ManifestParse { .. }));

        let err = Manifest::parse(b"not json").unwrap_err();
        assert!(matches!(err, UpdateError::ManifestParse { .. }));
    }

    #[test]
    fn parse_rejects_empty_checksum() {
        let raw = br#"{
            "packageUrl": "https://example.com/",
            "remoteManifestUrl": "https://example.com/project.manifest",
            "remoteVersionUrl": "https://example.com/version.manifest",
            "version": "1.0.0",
            "assets": {"a.js": {"md5": "", "size": 10}}
        }"#;
        let err = Manifest::parse(raw).unwrap_err();
        assert!(matches!(err, UpdateError::ManifestParse { .. }));
    }

    #[test]
    fn parse_accepts_minimal_manifest() {
        let raw = br#"{
            "packageUrl": "https://example.com/",
            "remoteManifestUrl": "https://example.com/project.manifest",
            "remoteVersionUrl": "https://example.com/version.manifest",
            "version": "1.0.0",
            "assets": {"a.js": {"md5": "abc", "size": 10}}
        }"#;
        let manifest = Manifest::parse(raw).unwrap();
        assert_eq!(manifest.version, "1.0.0");
        assert!(!manifest.assets["a.js"].compressed);
        assert!(manifest.search_paths.is_empty());
    }

    #[test]
    fn diff_is_reflexive() {
        let m = manifest("1.0.0", &[("a.js", entry("x", 1)), ("b.js", entry("y", 2))]);
        assert!(Manifest::diff(&m, &m).is_empty());
    }

    #[test]
    fn diff_classifies_added_and_changed() {
        let local = manifest("1.0.0", &[("a.js", entry("x", 1))]);
        let remote = manifest(
            "1.0.1",
            &[("a.js", entry("y", 1)), ("b.js", entry("z", 2))],
        );

        let delta = Manifest::diff(&local, &remote);
        assert_eq!(delta.to_add, BTreeSet::from(["b.js".to_string()]));
        assert_eq!(delta.to_update, BTreeSet::from(["a.js".to_string()]));
        assert!(delta.to_remove.is_empty());
        assert_eq!(
            delta.to_download(),
            BTreeSet::from(["a.js".to_string(), "b.js".to_string()])
        );
    }

    #[test]
    fn diff_ignores_size_only_mismatch() {
        let local = manifest("1.0.0", &[("a.js", entry("x", 1))]);
        let remote = manifest("1.0.1", &[("a.js", entry("x", 999))]);
        assert!(Manifest::diff(&local, &remote).is_empty());
    }

    #[test]
    fn diff_reports_local_only_entries() {
        let local = manifest("1.0.0", &[("gone.js", entry("x", 1))]);
        let remote = manifest("1.0.1", &[]);
        let delta = Manifest::diff(&local, &remote);
        assert_eq!(delta.to_remove, BTreeSet::from(["gone.js".to_string()]));
        assert!(delta.to_download().is_empty());
    }

    #[test]
    fn version_manifest_subset_round_trips() {
        let m = manifest("1.2.3", &[("a.js", entry("x", 1))]);
        let subset = m.version_manifest();
        let raw = serde_json::to_vec(&subset).unwrap();
        let parsed = VersionManifest::parse(&raw).unwrap();
        assert_eq!(parsed.version, "1.2.3");
        assert_eq!(parsed.package_url, m.package_url);
    }

    #[test]
    fn compare_versions_pads_missing_segments() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
    }

    #[test]
    fn compare_versions_is_antisymmetric() {
        let cases = [
            ("1.0.0", "1.0.1"),
            ("2.0", "1.9.9"),
            ("1.2.3", "1.2.3"),
            ("0.1", "0.0.9"),
        ];
        for (a, b) in cases {
            assert_eq!(compare_versions(a, b), compare_versions(b, a).reverse());
        }
    }

    #[test]
    fn compare_versions_treats_garbage_as_zero() {
        assert_eq!(compare_versions("1.x.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("abc", "0"), Ordering::Equal);
        assert_eq!(compare_versions("1.beta", "1.1"), Ordering::Less);
    }

    #[test]
    fn load_missing_manifest_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(dir.path().join("project.manifest"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(PROJECT_MANIFEST);
        let m = manifest("1.0.0", &[("a.js", entry("x", 1))]);
        m.persist(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap().expect("manifest exists");
        assert_eq!(loaded.version, "1.0.0");
        assert_eq!(loaded.assets, m.assets);
    }
}
