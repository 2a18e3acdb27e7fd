//! Subcommand implementations.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use hotpatch_core::{
    apply_pending,
    builder::{self, BuildOptions},
    host::{KeyValueStore, NullHooks},
    update::UpdateEvent,
    CheckOutcome, HttpSource, SearchPathList, SharedSearchPaths, UpdateOrchestrator,
    UpdateOutcome, UpdaterConfig,
};

use crate::store::JsonFileStore;

/// Name of the updater's durable state file inside the storage root.
const STATE_FILE: &str = "updater-state.json";

/// `generate-manifest`: scan `build_path` and write both manifests into it.
///
/// The package URL follows the original deployment layout: assets live
/// under `<server_url>/remote-assets/`.
pub fn generate_manifest(build_path: &Path, version: &str, server_url: &str) -> Result<()> {
    let base_url = format!("{}/remote-assets", server_url.trim_end_matches('/'));
    let manifest = builder::build(&BuildOptions::new(build_path, version, base_url))?;
    builder::write_manifests(&manifest, build_path)?;

    info!(
        assets = manifest.assets.len(),
        version,
        dest = %build_path.display(),
        "manifest generation complete"
    );
    Ok(())
}

/// `generate-version`: scan `source` and write both manifests into `dest`.
pub fn generate_version(source: &Path, dest: &Path, version: &str, url: &str) -> Result<()> {
    let manifest = builder::build(&BuildOptions::new(source, version, url))?;
    builder::write_manifests(&manifest, dest)?;

    info!(
        assets = manifest.assets.len(),
        version,
        dest = %dest.display(),
        "manifest generation complete"
    );
    Ok(())
}

/// `update`: run one full check/download/apply round as a headless host.
pub async fn update(
    config_path: Option<&Path>,
    manifest_override: Option<PathBuf>,
    storage_override: Option<PathBuf>,
    retry: bool,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => UpdaterConfig::load(Some(path))?,
        None => {
            let manifest = manifest_override.clone().context(
                "either --config or --manifest is required to locate the local manifest",
            )?;
            UpdaterConfig::new(manifest)
        }
    };
    if let Some(manifest) = manifest_override {
        config.local_manifest = manifest;
    }
    if let Some(storage) = storage_override {
        config.storage_root = storage;
    }

    let store: Arc<dyn KeyValueStore> =
        Arc::new(JsonFileStore::open(config.storage_root.join(STATE_FILE))?);
    let search_paths = SharedSearchPaths::new(SearchPathList::restore(store.as_ref(), []));

    // Re-apply anything a previous run left pending before touching assets.
    if let Some(path) = apply_pending(store.as_ref(), &NullHooks, &search_paths) {
        info!(path = %path, "re-applied pending update from previous run");
    }

    let source = Arc::new(HttpSource::new(Duration::from_secs(
        config.fetch_timeout_secs,
    ))?);

    let (events_tx, events_rx) = mpsc::channel(64);
    let reporter = tokio::spawn(report_events(events_rx));

    let mut orchestrator = UpdateOrchestrator::new(
        config,
        source,
        store,
        Arc::new(NullHooks),
        search_paths,
    )
    .with_events(events_tx);
    orchestrator.start()?;

    let result = run_session(&mut orchestrator, retry).await;
    drop(orchestrator);
    let _ = reporter.await;
    result
}

async fn run_session(orchestrator: &mut UpdateOrchestrator, retry: bool) -> Result<()> {
    match orchestrator.check_for_update().await? {
        CheckOutcome::UpToDate => {
            info!("already up to date");
            return Ok(());
        }
        CheckOutcome::NewVersion { local, remote } => {
            info!(local = %local, remote = %remote, "new version found, downloading");
        }
    }

    let mut outcome = orchestrator.update().await?;
    while retry {
        match &outcome {
            UpdateOutcome::Failed { can_retry: true, .. } => {
                outcome = orchestrator.retry_failed().await?;
            }
            _ => break,
        }
    }

    match outcome {
        UpdateOutcome::Applied { version } => {
            info!(version = %version, "update applied; restart the application to pick it up");
            Ok(())
        }
        UpdateOutcome::Failed { failed_paths, can_retry } => {
            bail!(
                "update failed for {} file(s) ({}): {}",
                failed_paths.len(),
                if can_retry {
                    "retry available"
                } else {
                    "retry budget exhausted"
                },
                failed_paths.into_iter().collect::<Vec<_>>().join(", ")
            )
        }
        UpdateOutcome::Cancelled => bail!("update was cancelled"),
    }
}

async fn report_events(mut events: mpsc::Receiver<UpdateEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UpdateEvent::StateChanged(state) => info!(?state, "state changed"),
            UpdateEvent::Progress {
                finished,
                total,
                fraction,
            } => info!(finished, total, percent = (fraction * 100.0) as u32, "progress"),
            UpdateEvent::AssetUpdated { path } => info!(path = %path, "downloaded"),
            UpdateEvent::AssetFailed { path, reason } => {
                info!(path = %path, reason = %reason, "failed")
            }
            UpdateEvent::Applied { version } => info!(version = %version, "applied"),
            UpdateEvent::RestartRequired => info!("restart required"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpatch_core::manifest::{Manifest, PROJECT_MANIFEST, VERSION_MANIFEST};
    use std::fs;

    #[test]
    fn generate_manifest_writes_into_build_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.js"), b"entry").unwrap();

        generate_manifest(dir.path(), "1.0.1", "https://cdn.example.com/").unwrap();

        let manifest = Manifest::load(dir.path().join(PROJECT_MANIFEST))
            .unwrap()
            .expect("manifest written");
        assert_eq!(manifest.version, "1.0.1");
        assert_eq!(
            manifest.package_url,
            "https://cdn.example.com/remote-assets/"
        );
        assert!(manifest.assets.contains_key("main.js"));
        assert!(dir.path().join(VERSION_MANIFEST).exists());
    }

    #[test]
    fn generate_version_writes_into_dest() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(source.path().join("a.js"), b"a").unwrap();

        generate_version(
            source.path(),
            &dest.path().join("out"),
            "2.0.0",
            "https://cdn.example.com/remote-assets",
        )
        .unwrap();

        let manifest = Manifest::load(dest.path().join("out").join(PROJECT_MANIFEST))
            .unwrap()
            .expect("manifest written");
        assert_eq!(manifest.version, "2.0.0");
        assert_eq!(
            manifest.remote_version_url,
            "https://cdn.example.com/remote-assets/version.manifest"
        );
    }

    #[test]
    fn generate_manifest_fails_on_missing_build_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(generate_manifest(&missing, "1.0.0", "https://x").is_err());
    }
}
