//! Update orchestrator: check, download, verify, promote, retry.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{info, warn};

use crate::{
    config::UpdaterConfig,
    error::{Result, UpdateError},
    host::{HostHooks, KeyValueStore},
    manifest::{compare_versions, Manifest, VersionManifest, PROJECT_MANIFEST},
    net::RemoteSource,
    search_path::SharedSearchPaths,
    verify,
};

/// Durable marker flag: a promoted update awaits re-application on startup.
pub const UPDATE_READY_KEY: &str = "hotUpdateReady";
/// Durable marker value: the content root that was promoted.
pub const UPDATE_PATH_KEY: &str = "hotUpdatePath";

/// Lifecycle states of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// No session in flight.
    Idle,
    /// Fetching and comparing the remote version manifest.
    Checking,
    /// Remote version is not newer than local. Terminal for the session.
    UpToDate,
    /// A newer remote manifest has been fetched and validated.
    NewVersionFound,
    /// The version or manifest check failed. Terminal; a new check may be
    /// started.
    CheckFailed,
    /// Transferring and verifying the delta.
    Downloading,
    /// The batch drained with failures; a retry may be requested.
    DownloadFailed,
    /// Promoting the storage root and persisting state.
    Applying,
    /// Update promoted; restart pending.
    Applied,
    /// Waiting for the host to restart or reload.
    PendingRestart,
    /// Session cancelled by the host. Terminal.
    Cancelled,
}

/// Typed progress events emitted over the session's channel.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The session moved to a new state.
    StateChanged(UpdateState),
    /// Download progress after each completed transfer.
    Progress {
        /// Files finished so far, including failures.
        finished: usize,
        /// Total files in this batch.
        total: usize,
        /// `finished / total` as a fraction.
        fraction: f32,
    },
    /// One asset downloaded and verified.
    AssetUpdated {
        /// Relative asset path.
        path: String,
    },
    /// One asset failed to download or verify.
    AssetFailed {
        /// Relative asset path.
        path: String,
        /// Human-readable failure description.
        reason: String,
    },
    /// The update was promoted into the search path.
    Applied {
        /// Version now active.
        version: String,
    },
    /// The host should restart or reload to re-resolve assets.
    RestartRequired,
}

/// Result of a check-for-update call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Local content is current.
    UpToDate,
    /// A newer remote version exists and its manifest has been fetched.
    NewVersion {
        /// Installed version.
        local: String,
        /// Available version.
        remote: String,
    },
}

/// Result of a download/apply round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// All files landed and the update was promoted.
    Applied {
        /// Version now active.
        version: String,
    },
    /// Some files failed; the session can be retried while `can_retry`.
    Failed {
        /// Paths that failed download or verification.
        failed_paths: BTreeSet<String>,
        /// Whether another retry round is allowed.
        can_retry: bool,
    },
    /// The session was cancelled before completing.
    Cancelled,
}

/// Cloneable token that stops a running session.
///
/// Once triggered no new transfers are issued; in-flight transfers drain
/// and the session ends in [`UpdateState::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(AtomicOrdering::SeqCst)
    }
}

/// State owned by one update session.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    /// Current lifecycle state.
    pub state: UpdateState,
    /// Paths that failed download or verification in the last batch.
    pub failed_paths: BTreeSet<String>,
    /// Whether [`UpdateOrchestrator::retry_failed`] is currently allowed.
    pub can_retry: bool,
    /// Retry rounds consumed so far.
    pub retries_used: u32,
    /// Writable root downloads land in.
    pub storage_path: PathBuf,
}

impl UpdateSession {
    fn new(storage_path: PathBuf) -> Self {
        Self {
            state: UpdateState::Idle,
            failed_paths: BTreeSet::new(),
            can_retry: false,
            retries_used: 0,
            storage_path,
        }
    }
}

/// Drives the whole update flow against host-supplied collaborators.
///
/// Explicitly constructed and owned by the host; one orchestrator owns one
/// [`UpdateSession`] at a time, so a second check while one is in flight is
/// rejected rather than queued.
pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn KeyValueStore>,
    hooks: Arc<dyn HostHooks>,
    search_paths: SharedSearchPaths,
    events: Option<mpsc::Sender<UpdateEvent>>,
    cancel: CancelHandle,
    session: UpdateSession,
    started: bool,
    local: Option<Manifest>,
    remote: Option<Manifest>,
}

impl UpdateOrchestrator {
    /// Build an orchestrator over the given collaborators.
    pub fn new(
        config: UpdaterConfig,
        source: Arc<dyn RemoteSource>,
        store: Arc<dyn KeyValueStore>,
        hooks: Arc<dyn HostHooks>,
        search_paths: SharedSearchPaths,
    ) -> Self {
        let session = UpdateSession::new(config.storage_root.clone());
        Self {
            config,
            source,
            store,
            hooks,
            search_paths,
            events: None,
            cancel: CancelHandle::default(),
            session,
            started: false,
            local: None,
            remote: None,
        }
    }

    /// Attach a typed event channel for progress reporting.
    pub fn with_events(mut self, sender: mpsc::Sender<UpdateEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Prepare the orchestrator: ensure the storage root exists and load
    /// the local manifest. Idempotent.
    ///
    /// The storage copy of `project.manifest` takes precedence over the
    /// bundled manifest, since it reflects previously applied updates.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        std::fs::create_dir_all(&self.config.storage_root).map_err(|err| {
            UpdateError::Storage {
                path: self.config.storage_root.clone(),
                reason: format!("failed to create storage root: {err}"),
            }
        })?;

        let storage_manifest = self.config.storage_root.join(PROJECT_MANIFEST);
        self.local = match Manifest::load(&storage_manifest) {
            Ok(Some(manifest)) => {
                info!(version = %manifest.version, "loaded manifest from storage root");
                Some(manifest)
            }
            Ok(None) => match Manifest::load(&self.config.local_manifest) {
                Ok(found) => found,
                Err(err) => {
                    return Err(UpdateError::ManifestParse {
                        reason: err.to_string(),
                    })
                }
            },
            Err(err) => {
                // A corrupt storage manifest must not brick updates; fall
                // back to the bundled one.
                warn!("storage manifest unreadable, falling back to bundled: {err}");
                Manifest::load(&self.config.local_manifest).map_err(|err| {
                    UpdateError::ManifestParse {
                        reason: err.to_string(),
                    }
                })?
            }
        };

        self.started = true;
        Ok(())
    }

    /// Tear the session down. Idempotent; safe to call at any time.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.session = UpdateSession::new(self.config.storage_root.clone());
        self.cancel = CancelHandle::default();
        self.remote = None;
        self.started = false;
    }

    /// Current session state.
    pub fn state(&self) -> UpdateState {
        self.session.state
    }

    /// Read access to the current session.
    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    /// Version of the currently installed local manifest, if any.
    pub fn local_version(&self) -> Option<&str> {
        self.local.as_ref().map(|manifest| manifest.version.as_str())
    }

    /// Token that cancels the in-flight session.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Fetch the remote version manifest and decide whether an update is
    /// available. Rejected while a session is already past the check phase.
    pub async fn check_for_update(&mut self) -> Result<CheckOutcome> {
        match self.session.state {
            UpdateState::Idle
            | UpdateState::UpToDate
            | UpdateState::CheckFailed
            | UpdateState::Cancelled => {}
            state => {
                return Err(UpdateError::State {
                    reason: format!("cannot check for updates while {state:?}"),
                })
            }
        }
        if !self.started {
            return Err(UpdateError::State {
                reason: "orchestrator has not been started".to_string(),
            });
        }

        let local = self.local.clone().ok_or_else(|| UpdateError::ManifestParse {
            reason: "no local manifest found".to_string(),
        })?;

        // A cancellation belongs to the session it was issued in; each new
        // session starts with a fresh token.
        self.cancel = CancelHandle::default();
        self.set_state(UpdateState::Checking);
        self.session.failed_paths.clear();
        self.session.can_retry = false;
        self.session.retries_used = 0;

        let remote_version = match self.fetch_version_manifest(&local).await {
            Ok(manifest) => manifest,
            Err(err) => {
                self.set_state(UpdateState::CheckFailed);
                return Err(err);
            }
        };

        if compare_versions(&remote_version.version, &local.version) != Ordering::Greater {
            info!(
                local = %local.version,
                remote = %remote_version.version,
                "already up to date"
            );
            self.set_state(UpdateState::UpToDate);
            return Ok(CheckOutcome::UpToDate);
        }

        let remote = match self.fetch_full_manifest(&remote_version).await {
            Ok(manifest) => manifest,
            Err(err) => {
                self.set_state(UpdateState::CheckFailed);
                return Err(err);
            }
        };

        info!(
            local = %local.version,
            remote = %remote.version,
            "new version found"
        );
        let outcome = CheckOutcome::NewVersion {
            local: local.version.clone(),
            remote: remote.version.clone(),
        };
        self.remote = Some(remote);
        self.set_state(UpdateState::NewVersionFound);
        Ok(outcome)
    }

    /// Download the delta, verify every file and promote the update.
    /// Only legal from [`UpdateState::NewVersionFound`].
    pub async fn update(&mut self) -> Result<UpdateOutcome> {
        if self.session.state != UpdateState::NewVersionFound {
            return Err(UpdateError::State {
                reason: format!("cannot update while {:?}", self.session.state),
            });
        }

        let local = self.local.clone().expect("local manifest present after check");
        let remote = self.remote.clone().expect("remote manifest present after check");
        let delta = Manifest::diff(&local, &remote);
        let to_download = delta.to_download();

        info!(
            add = delta.to_add.len(),
            update = delta.to_update.len(),
            skip_remove = delta.to_remove.len(),
            "starting download phase"
        );

        self.set_state(UpdateState::Downloading);
        self.download_batch(&remote, to_download).await;
        self.finish_download_round(remote).await
    }

    /// Re-attempt only the paths that failed in the previous round, with
    /// exponential backoff and a bounded number of rounds.
    pub async fn retry_failed(&mut self) -> Result<UpdateOutcome> {
        if self.session.state != UpdateState::DownloadFailed {
            return Err(UpdateError::State {
                reason: format!("cannot retry while {:?}", self.session.state),
            });
        }
        if !self.session.can_retry {
            return Err(UpdateError::State {
                reason: "retry budget exhausted".to_string(),
            });
        }

        let remote = self.remote.clone().expect("remote manifest present after check");
        let failed = std::mem::take(&mut self.session.failed_paths);

        self.session.retries_used += 1;
        let backoff = Duration::from_millis(
            self.config.retry_backoff_ms << (self.session.retries_used - 1).min(16),
        );
        info!(
            round = self.session.retries_used,
            paths = failed.len(),
            ?backoff,
            "retrying failed downloads"
        );
        tokio::time::sleep(backoff).await;

        self.set_state(UpdateState::Downloading);
        self.download_batch(&remote, failed).await;
        self.finish_download_round(remote).await
    }

    /// Decide how a drained batch ends: cancelled, failed or applied.
    async fn finish_download_round(&mut self, remote: Manifest) -> Result<UpdateOutcome> {
        if self.cancel.is_cancelled() {
            self.set_state(UpdateState::Cancelled);
            return Ok(UpdateOutcome::Cancelled);
        }

        if !self.session.failed_paths.is_empty() {
            self.session.can_retry = self.session.retries_used < self.config.max_retries;
            self.set_state(UpdateState::DownloadFailed);
            warn!(
                failed = self.session.failed_paths.len(),
                can_retry = self.session.can_retry,
                "download round finished with failures"
            );
            return Ok(UpdateOutcome::Failed {
                failed_paths: self.session.failed_paths.clone(),
                can_retry: self.session.can_retry,
            });
        }

        self.apply(remote)
    }

    /// Drain the whole batch before deciding success or failure; individual
    /// failures are recorded, never aborting the round.
    async fn download_batch(&mut self, remote: &Manifest, paths: BTreeSet<String>) {
        let total = paths.len();
        let mut finished = 0usize;
        let base_url = normalize_base_url(&remote.package_url);
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        for rel_path in paths {
            if self.cancel.is_cancelled() {
                break;
            }

            while tasks.len() >= self.config.max_concurrent.max(1) {
                if let Some(joined) = tasks.join_next().await {
                    self.record_download(joined, &mut finished, total);
                }
            }

            let entry = remote
                .assets
                .get(&rel_path)
                .expect("batch paths come from the remote manifest");
            // Recorded as failed up front and cleared again when the
            // transfer reports success.
            self.session.failed_paths.insert(rel_path.clone());
            tasks.spawn(download_one(
                Arc::clone(&self.source),
                base_url.clone(),
                rel_path,
                entry.md5.clone(),
                self.config.storage_root.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            self.record_download(joined, &mut finished, total);
        }
    }

    fn record_download(
        &mut self,
        joined: std::result::Result<(String, Result<()>), tokio::task::JoinError>,
        finished: &mut usize,
        total: usize,
    ) {
        *finished += 1;
        match joined {
            Ok((path, Ok(()))) => {
                self.session.failed_paths.remove(&path);
                self.emit(UpdateEvent::AssetUpdated { path });
            }
            Ok((path, Err(err))) => {
                warn!(path = %path, "asset failed: {err}");
                self.emit(UpdateEvent::AssetFailed {
                    path: path.clone(),
                    reason: err.to_string(),
                });
                self.session.failed_paths.insert(path);
            }
            Err(err) => {
                // A panicked worker loses its output, but its path was
                // recorded as failed at spawn time and stays recorded.
                warn!("download task panicked: {err}");
            }
        }
        self.emit(UpdateEvent::Progress {
            finished: *finished,
            total,
            fraction: if total == 0 {
                1.0
            } else {
                *finished as f32 / total as f32
            },
        });
    }

    /// Promote the storage root, persist durable state and hand control
    /// back to the host for a restart.
    fn apply(&mut self, remote: Manifest) -> Result<UpdateOutcome> {
        self.set_state(UpdateState::Applying);

        // The manifest write is the last fallible step; the search path and
        // the durable ready marker only change once it has succeeded.
        remote
            .persist(self.config.storage_root.join(PROJECT_MANIFEST))
            .map_err(|err| UpdateError::Storage {
                path: self.config.storage_root.clone(),
                reason: err.to_string(),
            })?;

        let storage = self.config.storage_root.to_string_lossy().into_owned();
        self.search_paths
            .promote_and_persist(&storage, self.store.as_ref());
        self.store.set(UPDATE_READY_KEY, "true");
        self.store.set(UPDATE_PATH_KEY, &storage);

        let version = remote.version.clone();
        self.local = Some(remote);
        self.remote = None;

        self.hooks.invalidate_assets();
        self.set_state(UpdateState::Applied);
        self.emit(UpdateEvent::Applied {
            version: version.clone(),
        });
        info!(version = %version, "update applied, restart required");

        self.hooks.request_restart();
        self.emit(UpdateEvent::RestartRequired);
        self.set_state(UpdateState::PendingRestart);

        Ok(UpdateOutcome::Applied { version })
    }

    async fn fetch_version_manifest(&self, local: &Manifest) -> Result<VersionManifest> {
        let bytes = self.source.fetch(&local.remote_version_url).await?;
        VersionManifest::parse(&bytes)
    }

    async fn fetch_full_manifest(&self, version: &VersionManifest) -> Result<Manifest> {
        let bytes = self.source.fetch(&version.remote_manifest_url).await?;
        Manifest::parse(&bytes)
    }

    fn set_state(&mut self, state: UpdateState) {
        self.session.state = state;
        self.emit(UpdateEvent::StateChanged(state));
    }

    fn emit(&self, event: UpdateEvent) {
        if let Some(sender) = &self.events {
            // Progress reporting must never stall the pipeline; a full
            // channel just drops the event.
            let _ = sender.try_send(event);
        }
    }
}

/// Re-apply a promoted update on process start, before any asset is
/// resolved. Idempotent: promoting an already-first path is a no-op, and
/// the marker is cleared either way.
///
/// Returns the promoted content root when a pending update was found.
pub fn apply_pending(
    store: &dyn KeyValueStore,
    hooks: &dyn HostHooks,
    search_paths: &SharedSearchPaths,
) -> Option<String> {
    let ready = store.get(UPDATE_READY_KEY);
    let path = store.get(UPDATE_PATH_KEY);

    match (ready.as_deref(), path) {
        (Some("true"), Some(path)) => {
            info!(path = %path, "re-applying pending update");
            search_paths.promote_and_persist(&path, store);
            hooks.invalidate_assets();
            store.remove(UPDATE_READY_KEY);
            store.remove(UPDATE_PATH_KEY);
            Some(path)
        }
        _ => None,
    }
}

/// Download, verify and atomically place one asset under the storage root.
///
/// The file is only renamed into its final location after the checksum
/// matches, so a failed transfer never leaves a partially promoted asset.
async fn download_one(
    source: Arc<dyn RemoteSource>,
    base_url: String,
    rel_path: String,
    expected_md5: String,
    storage_root: PathBuf,
) -> (String, Result<()>) {
    let result = async {
        let url = format!("{base_url}{rel_path}");
        let bytes = source.fetch(&url).await?;

        // Hashing is CPU work; push it off the reactor and join before
        // reporting the file's status.
        let rel = rel_path.clone();
        let verified = tokio::task::spawn_blocking(move || {
            verify::verify_bytes(&rel, &bytes, &expected_md5).map(|_| bytes)
        })
        .await
        .map_err(|err| UpdateError::Storage {
            path: storage_root.clone(),
            reason: format!("verification task failed: {err}"),
        })??;

        write_atomic(&storage_root, &rel_path, &verified).await
    }
    .await;

    (rel_path, result)
}

async fn write_atomic(storage_root: &Path, rel_path: &str, bytes: &[u8]) -> Result<()> {
    let dest = storage_root.join(rel_path);
    let partial = storage_root.join(format!("{rel_path}.part"));
    let storage_err = |reason: String| UpdateError::Storage {
        path: dest.clone(),
        reason,
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| storage_err(format!("failed to create {}: {err}", parent.display())))?;
    }

    tokio::fs::write(&partial, bytes)
        .await
        .map_err(|err| storage_err(format!("failed to write: {err}")))?;
    tokio::fs::rename(&partial, &dest)
        .await
        .map_err(|err| storage_err(format!("failed to rename into place: {err}")))
}

fn normalize_base_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    format!("{trimmed}/")
}
