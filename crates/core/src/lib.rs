#![warn(clippy::all, missing_docs)]

//! Remote asset synchronization core.
//!
//! This crate hosts the manifest model, content verification, the offline
//! manifest builder, the update orchestrator state machine and the
//! search-path resolver used by the command-line tools and any embedding
//! host. Everything host-specific (durable storage, asset caches, restart)
//! is consumed through the traits in [`host`].

pub mod builder;
pub mod config;
pub mod error;
pub mod host;
pub mod manifest;
pub mod net;
pub mod search_path;
pub mod update;
pub mod verify;

pub use config::UpdaterConfig;
pub use error::UpdateError;
pub use manifest::{compare_versions, AssetDelta, AssetEntry, Manifest, VersionManifest};
pub use net::{HttpSource, RemoteSource};
pub use search_path::{SearchPathList, SharedSearchPaths};
pub use update::{
    apply_pending, CancelHandle, CheckOutcome, UpdateEvent, UpdateOrchestrator, UpdateOutcome,
    UpdateSession, UpdateState,
};
