//! Sync Orchestrator
//!
//! One pass of the image sync: read the catalog, decide whether the object
//! store is ready, reconcile the product-streams endpoint, mirror images and
//! report the outcome through workload status.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Local;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::{is_object_store_present, CatalogSnapshot, CatalogSource};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::juju::{EndpointNotifier, ProxySource, StatusReporter, WorkloadStatus};
use crate::mirror::{do_sync, CommandRunner};
use crate::proxy::get_sstream_mirror_proxy_env;
use crate::reconcile::{update_product_streams_service, ReconcileAction, PRODUCT_STREAMS_SERVICE_NAME};

/// Per-minute cron entry installed until the first sync succeeds
pub const CRON_POLL_FILENAME: &str = "/etc/cron.d/glance_simplestreams_sync_fastpoll";

pub const SYNCING_MESSAGE: &str = "Synchronising images";
pub const WAITING_FOR_OBJECT_STORE_MESSAGE: &str =
    "Swift usage has been requested but its endpoints are not yet in the catalog";
pub const SYNC_FAILED_MESSAGE: &str = "Image sync failed, retrying soon.";

/// What happened to the product-streams endpoint during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStreamsState {
    NotChecked,
    /// Metadata is not published to the object store
    NotApplicable,
    /// Object store in use but it, or the product-streams service, is not registered
    Skipped,
    Reconciled(ReconcileAction),
}

/// Terminal outcome of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(ProductStreamsState),
    /// Object store requested but not in the catalog yet
    WaitingForObjectStore,
    /// Glance endpoints not registered yet
    ImageEndpointPending,
    Blocked,
}

/// Report whether the run may proceed with the requested storage.
///
/// Returns `false`, after setting a maintenance status, only when the object
/// store is requested but absent.
pub fn assess_object_store_state<S: StatusReporter + ?Sized>(
    status: &S,
    use_swift: bool,
    object_store_exists: bool,
) -> bool {
    if use_swift && !object_store_exists {
        status.status_set(WorkloadStatus::Maintenance, WAITING_FOR_OBJECT_STORE_MESSAGE);
        return false;
    }
    true
}

/// "Unit is ready" message for a finished sync at `timestamp`
pub fn active_message(timestamp: &str, uploaded_to_object_store: bool) -> String {
    if uploaded_to_object_store {
        format!(
            "Unit is ready (Glance sync completed at {}, metadata uploaded to object store)",
            timestamp
        )
    } else {
        format!(
            "Unit is ready (Glance sync completed at {}, metadata not uploaded - object-store usage disabled)",
            timestamp
        )
    }
}

pub fn set_active_status<S: StatusReporter + ?Sized>(status: &S, uploaded_to_object_store: bool) {
    let timestamp = Local::now().format("%x %X").to_string();
    status.status_set(
        WorkloadStatus::Active,
        &active_message(&timestamp, uploaded_to_object_store),
    );
}

/// Drives a single sync run against injected collaborators
pub struct SyncAgent<'a> {
    config: &'a SyncConfig,
    catalog: &'a dyn CatalogSource,
    status: &'a dyn StatusReporter,
    notifier: &'a dyn EndpointNotifier,
    proxy: &'a dyn ProxySource,
    runner: &'a dyn CommandRunner,
    work_dir: PathBuf,
    fast_poll_file: PathBuf,
    cacert_path: Option<PathBuf>,
}

impl<'a> SyncAgent<'a> {
    pub fn new<U>(
        config: &'a SyncConfig,
        catalog: &'a dyn CatalogSource,
        unit: &'a U,
        runner: &'a dyn CommandRunner,
    ) -> Self
    where
        U: StatusReporter + EndpointNotifier + ProxySource,
    {
        Self {
            config,
            catalog,
            status: unit,
            notifier: unit,
            proxy: unit,
            runner,
            work_dir: std::env::temp_dir(),
            fast_poll_file: PathBuf::from(CRON_POLL_FILENAME),
            cacert_path: None,
        }
    }

    /// Parent directory for scratch output (must be under `$HOME` for the snap)
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_fast_poll_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.fast_poll_file = path.into();
        self
    }

    /// Installed CA bundle exported as `OS_CACERT`
    pub fn with_cacert_path(mut self, path: Option<PathBuf>) -> Self {
        self.cacert_path = path;
        self
    }

    /// Run once. Failures are reported through status, never returned.
    pub async fn run(&self) -> SyncOutcome {
        let outcome = match self.try_run().await {
            Ok(outcome) => outcome,
            Err(e) if e.is_image_endpoint_missing() => {
                info!(error = %e, "Glance endpoint not found, will continue polling.");
                SyncOutcome::ImageEndpointPending
            }
            Err(e) => {
                error!(error = %e, "Exception during syncing");
                self.status.status_set(WorkloadStatus::Blocked, SYNC_FAILED_MESSAGE);
                SyncOutcome::Blocked
            }
        };
        info!(?outcome, "Sync done");
        outcome
    }

    async fn try_run(&self) -> Result<SyncOutcome> {
        let mirrors = &self.config.mirrors;
        let snapshot = self.catalog.snapshot().await?;

        let object_store_exists = is_object_store_present(&snapshot.catalog, &mirrors.region);
        let ps_service_exists = snapshot.has_service(PRODUCT_STREAMS_SERVICE_NAME);
        info!(
            ps_service_exists,
            use_swift = mirrors.use_swift,
            object_store_exists,
            "Assessed catalog"
        );

        if !assess_object_store_state(self.status, mirrors.use_swift, object_store_exists) {
            info!("Object store not yet ready");
            return Ok(SyncOutcome::WaitingForObjectStore);
        }

        let state = self.reconcile_product_streams(&snapshot, ps_service_exists)?;

        info!("Beginning image sync");
        self.status.status_set(WorkloadStatus::Maintenance, SYNCING_MESSAGE);

        let env = self.mirror_env(&snapshot)?;
        do_sync(mirrors, &env, self.runner, &self.work_dir)?;

        set_active_status(self.status, mirrors.use_swift);
        self.remove_fast_poll()?;

        Ok(SyncOutcome::Completed(state))
    }

    fn reconcile_product_streams(
        &self,
        snapshot: &CatalogSnapshot,
        ps_service_exists: bool,
    ) -> Result<ProductStreamsState> {
        if !self.config.mirrors.use_swift {
            return Ok(ProductStreamsState::NotApplicable);
        }
        if !ps_service_exists {
            info!("Not updating product streams service");
            return Ok(ProductStreamsState::Skipped);
        }

        info!("Updating product streams service");
        let action = update_product_streams_service(
            &snapshot.catalog,
            &snapshot.services,
            &self.config.mirrors.region,
            self.notifier,
        )?;
        Ok(ProductStreamsState::Reconciled(action))
    }

    /// `OS_*` variables plus the proxy exemptions for the mirror command
    fn mirror_env(&self, snapshot: &CatalogSnapshot) -> Result<BTreeMap<String, String>> {
        let mirrors = &self.config.mirrors;
        let mut env = self
            .config
            .identity
            .openstack_env(&mirrors.region, self.cacert_path.as_deref());

        let ambient = self.proxy.proxy_settings()?;
        env.extend(get_sstream_mirror_proxy_env(
            &snapshot.catalog,
            &mirrors.region,
            ambient,
            mirrors.ignore_proxy_for_object_store,
        )?);
        Ok(env)
    }

    fn remove_fast_poll(&self) -> Result<()> {
        match fs::remove_file(&self.fast_poll_file) {
            Ok(()) => {
                info!(path = %self.fast_poll_file.display(), "Initial sync attempt done: every-minute cronjob removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.fast_poll_file.display(), error = %e, "Failed to remove fast-poll cronjob");
                Err(e.into())
            }
        }
    }
}
