//! One-shot synchronization of a working directory through a cache slot.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::cache::{CacheDirectoryRegistry, CacheSlot};
use crate::changes::{ChangeSetExtractor, Changeset};
use crate::checkout::CheckoutEngine;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fetch::{FetchEngine, FetchOutcome};
use crate::sink::{CredentialStore, ProgressSink};
use crate::types::{CacheSignature, CancelToken, RepositoryAccessData};

/// What to bring a working directory to.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub access: RepositoryAccessData,
    pub work_dir: PathBuf,
    /// Revision to check out; the fetched branch head when `None`.
    pub revision: Option<String>,
    /// Revision of the previous build, the lower bound of the changeset.
    pub previous: Option<String>,
    pub change_limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub slot: PathBuf,
    pub fetch: FetchOutcome,
    pub changes: Changeset,
    /// Full id of the commit now checked out.
    pub revision: String,
    /// The slot was deleted and rebuilt after a first failed attempt.
    pub recovered: bool,
}

/// Acquire, lock, fetch, diff and check out in one call.
pub struct BuildSync {
    registry: CacheDirectoryRegistry,
    fetch: FetchEngine,
    checkout: CheckoutEngine,
    changes: ChangeSetExtractor,
}

impl BuildSync {
    pub fn new(
        registry: CacheDirectoryRegistry,
        fetch: FetchEngine,
        checkout: CheckoutEngine,
    ) -> Self {
        Self {
            registry,
            fetch,
            checkout,
            changes: ChangeSetExtractor::new(),
        }
    }

    pub fn from_config(config: &SyncConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let backend = config.backend();
        Self::new(
            config.registry(),
            FetchEngine::new(backend.clone(), credentials)
                .with_branch_switch(config.shallow_branch_switch),
            CheckoutEngine::new(backend),
        )
    }

    pub fn registry(&self) -> &CacheDirectoryRegistry {
        &self.registry
    }

    /// Run the sync. A failure that points at a damaged slot deletes the slot
    /// and retries exactly once.
    pub fn sync(
        &self,
        request: &SyncRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<SyncReport, SyncError> {
        let signature = CacheSignature::from_access(&request.access);
        let slot = self.registry.acquire(signature.as_str(), cancel)?;

        match self.sync_slot(&slot, request, sink, cancel) {
            Ok(report) => Ok(report),
            Err(e) if e.suggests_local_corruption() => {
                log::warn!(
                    "Sync through {} failed ({}), rebuilding the cache slot",
                    slot.root.display(),
                    e
                );
                self.registry.delete(&slot, cancel)?;
                let slot = self.registry.acquire(signature.as_str(), cancel)?;
                let mut report = self.sync_slot(&slot, request, sink, cancel)?;
                report.recovered = true;
                Ok(report)
            }
            Err(e) => Err(e),
        }
    }

    fn sync_slot(
        &self,
        slot: &CacheSlot,
        request: &SyncRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<SyncReport, SyncError> {
        let _guard = self.registry.lock_slot(slot, cancel)?;
        let repository = slot.repository();

        let fetch = self.fetch.fetch(
            &repository,
            &request.access,
            request.access.use_shallow_clones,
            sink,
            cancel,
        )?;
        let revision = request.revision.as_deref().unwrap_or(&fetch.head);

        let changes = self.changes.extract(
            &repository,
            request.previous.as_deref(),
            revision,
            request.change_limit,
        )?;

        let revision = self.checkout.checkout_with_cancel(
            &repository,
            &request.work_dir,
            revision,
            request.previous.as_deref(),
            sink,
            cancel,
        )?;

        log::info!(
            "{} is at {} ({} new commits)",
            request.work_dir.display(),
            revision,
            changes.total()
        );
        Ok(SyncReport {
            slot: slot.root.clone(),
            fetch,
            changes,
            revision,
            recovered: false,
        })
    }
}
