use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{Client, ResourceExt as _};
use snafu::ResultExt as _;
use tracing::{debug, info, instrument, warn};

use super::{
    kube_ops::{is_already_exists, is_not_found},
    resources::{
        build_cluster_role_binding, build_job, build_pvc, build_service_account,
        build_volume_snapshot, service_account_subject,
    },
    size::{calculate_pvc_size, parse_quantity},
    KubeClient, KubeOps, ResourceHandler, Spec,
};
use crate::{
    config::SnapshottingConfig,
    crd::{SnapshottingPhase, SnapshottingStatus, VolumeSnapshot},
    AppError, KubeSnafu, Result, UnknownPhaseSnafu,
};

/// Drives the snapshotting workflow of one owning resource kind.
#[derive(Clone)]
pub struct Manager {
    pub(super) ops: Arc<dyn KubeOps>,
    pub(super) handler: Arc<dyn ResourceHandler>,
    pub(super) config: SnapshottingConfig,
}

impl Manager {
    pub fn new(
        ops: Arc<dyn KubeOps>, handler: Arc<dyn ResourceHandler>, config: SnapshottingConfig,
    ) -> Self {
        Self { ops, handler, config }
    }

    /// Manager backed by the API server, with its Job and VolumeSnapshot controllers running in
    /// the background.
    pub fn register(
        client: Client, handler: Arc<dyn ResourceHandler>, config: SnapshottingConfig,
    ) -> Self {
        let manager = Self::new(Arc::new(KubeClient::new(client.clone())), handler, config);
        manager.spawn_controllers(client);
        manager
    }

    /// Advance the workflow by at most one step. Safe to call on every reconcile.
    #[instrument(
        skip_all,
        fields(kind = %self.handler.resource_type(), ns = %spec.namespace, name = %spec.name)
    )]
    pub async fn do_snapshot(&self, spec: &Spec) -> Result<()> {
        let size = self.handler.get_content_size(&spec.namespace, &spec.name).await?;
        if size == 0 {
            info!("No content to snapshot");
            return Ok(());
        }

        let status = self.handler.get_snapshotting_status(&spec.namespace, &spec.name).await?;

        match status.current_phase() {
            SnapshottingPhase::PreparePvc => self.prepare_pvc(spec, &status, size).await,
            SnapshottingPhase::PvcReady => self.start_download(spec, &status).await,
            SnapshottingPhase::Downloaded => self.start_snapshot(spec, &status).await,
            // The Job and VolumeSnapshot controllers move these along
            SnapshottingPhase::Downloading | SnapshottingPhase::Snapshotting => Ok(()),
            SnapshottingPhase::SnapshotReady | SnapshottingPhase::Failed => Ok(()),
            SnapshottingPhase::Unknown(phase) => UnknownPhaseSnafu { phase }.fail(),
        }
    }

    /// Delete whatever the current run created and clear the status.
    #[instrument(
        skip_all,
        fields(kind = %self.handler.resource_type(), ns = %spec.namespace, name = %spec.name)
    )]
    pub async fn cancel_snapshot(&self, spec: &Spec) -> Result<()> {
        let status = self.handler.get_snapshotting_status(&spec.namespace, &spec.name).await?;
        if status.is_empty() {
            debug!("No snapshotting in progress");
            return Ok(());
        }
        info!(phase = %status.current_phase(), "Cancelling snapshotting");

        let ns = spec.namespace.as_str();
        if !status.snapshot_name.is_empty() {
            let res = self.ops.delete_volume_snapshot(ns, &status.snapshot_name).await;
            log_cleanup("VolumeSnapshot", &status.snapshot_name, res);
        }
        if !status.job_name.is_empty() {
            let res = self.ops.delete_job(ns, &status.job_name).await;
            log_cleanup("Job", &status.job_name, res);
        }
        if !status.pvc_name.is_empty() {
            let res = self.ops.delete_pvc(ns, &status.pvc_name).await;
            log_cleanup("PersistentVolumeClaim", &status.pvc_name, res);
        }

        self.handler.update_snapshotting_status(ns, &spec.name, None).await
    }

    async fn prepare_pvc(
        &self, spec: &Spec, status: &SnapshottingStatus, content_size: i64,
    ) -> Result<()> {
        info!("Preparing PVC");
        if let Err(err) = self.create_pvc(spec, content_size).await {
            let message = format!("Failed to create PVC: {err}");
            return self.stay(spec, status, SnapshottingPhase::PreparePvc, message, err).await;
        }

        let next = SnapshottingStatus::new(SnapshottingPhase::PvcReady, "PVC created successfully")
            .with_pvc(&spec.name);
        self.update_status(&spec.namespace, &spec.name, &next).await
    }

    async fn start_download(&self, spec: &Spec, status: &SnapshottingStatus) -> Result<()> {
        info!("Creating download Job");
        if let Err(err) = self.ensure_service_account(&spec.namespace).await {
            let message = format!("Failed to ensure ServiceAccount and ClusterRoleBinding: {err}");
            return self.stay(spec, status, SnapshottingPhase::PvcReady, message, err).await;
        }
        if let Err(err) = self.create_job(spec).await {
            let message = format!("Failed to create Job: {err}");
            return self.stay(spec, status, SnapshottingPhase::PvcReady, message, err).await;
        }

        let next = SnapshottingStatus::new(
            SnapshottingPhase::Downloading,
            "Job created successfully, downloading in progress",
        )
        .with_pvc(&spec.name)
        .with_job(&spec.name);
        self.update_status(&spec.namespace, &spec.name, &next).await
    }

    async fn start_snapshot(&self, spec: &Spec, status: &SnapshottingStatus) -> Result<()> {
        info!("Creating VolumeSnapshot");
        if let Err(err) = self.create_volume_snapshot(spec).await {
            let message = format!("Failed to create VolumeSnapshot: {err}");
            return self.stay(spec, status, SnapshottingPhase::Downloaded, message, err).await;
        }

        let next = SnapshottingStatus::new(
            SnapshottingPhase::Snapshotting,
            "VolumeSnapshot created successfully, snapshotting in progress",
        )
        .with_pvc(&spec.name)
        .with_job(&spec.name)
        .with_snapshot(&spec.name);
        self.update_status(&spec.namespace, &spec.name, &next).await
    }

    pub(super) async fn update_status(
        &self, ns: &str, name: &str, status: &SnapshottingStatus,
    ) -> Result<()> {
        debug!(ns, name, phase = %status.current_phase(), "Updating snapshotting status");
        self.handler.update_snapshotting_status(ns, name, Some(status)).await
    }

    /// Record `message` without leaving `phase`, then hand `err` back so the caller retries.
    /// Resource names already recorded are kept so a later cancel still finds them.
    async fn stay(
        &self, spec: &Spec, current: &SnapshottingStatus, phase: SnapshottingPhase,
        message: String, err: AppError,
    ) -> Result<()> {
        warn!(phase = %phase, %message, "Snapshotting step failed");
        let mut status = SnapshottingStatus::new(phase, message);
        status.pvc_name.clone_from(&current.pvc_name);
        status.job_name.clone_from(&current.job_name);
        status.snapshot_name.clone_from(&current.snapshot_name);

        if let Err(update_err) = self.update_status(&spec.namespace, &spec.name, &status).await {
            warn!(error = %update_err, "Failed to record snapshotting error");
        }
        Err(err)
    }

    async fn create_pvc(&self, spec: &Spec, content_size: i64) -> Result<()> {
        let (ns, name) = (spec.namespace.as_str(), spec.name.as_str());
        let existing = self
            .ops
            .get_pvc(ns, name)
            .await
            .with_context(|_| KubeSnafu { msg: format!("failed to get pvc {ns}/{name}") })?;
        if existing.is_some() {
            debug!("PVC already exists");
            return Ok(());
        }

        let mut storage = if spec.pvc_spec.size.is_empty() {
            calculate_pvc_size(content_size)?
        } else {
            spec.pvc_spec.size.clone()
        };

        let mut data_source = None;
        if spec.pvc_spec.restore_from_latest_snapshot {
            if let Some(snapshot) = self.latest_ready_snapshot(spec).await {
                let requested = parse_quantity(&Quantity(storage.clone()));
                if let Some(restore_size) = snapshot.restore_size() {
                    if requested < parse_quantity(restore_size) {
                        debug!(restore_size = %restore_size.0, "Growing PVC to the restore size");
                        storage.clone_from(&restore_size.0);
                    }
                }
                data_source = Some(snapshot.name_any());
            }
        }

        let pvc = build_pvc(spec, &self.config, &storage, data_source.as_deref())?;
        debug!(%storage, data_source = ?data_source, "Creating PVC");
        match self.ops.create_pvc(&pvc).await {
            Err(err) if !is_already_exists(&err) => Err(err).with_context(|_| KubeSnafu {
                msg: format!("failed to create pvc {ns}/{name}"),
            }),
            _ => Ok(()),
        }
    }

    /// Ready VolumeSnapshot to restore from. Any problem finding one is logged and means
    /// starting from an empty PVC.
    async fn latest_ready_snapshot(&self, spec: &Spec) -> Option<VolumeSnapshot> {
        let Some(owner) = spec.pvc_spec.owner_label.as_ref().and_then(|x| spec.labels.get(x))
        else {
            warn!("Restoring from the latest snapshot needs an owner label, starting empty");
            return None;
        };

        let snapshot = match self.handler.get_latest_ready_snapshot(&spec.namespace, owner).await {
            Ok(Some(x)) => x,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, owner, "Failed to get latest snapshot");
                return None;
            }
        };

        match self.ops.get_volume_snapshot(&spec.namespace, &snapshot).await {
            Ok(Some(vs)) if vs.ready_to_use() => Some(vs),
            Ok(Some(_)) => {
                warn!(snapshot, "Snapshot is not ready to use, skip restore from snapshot");
                None
            }
            Ok(None) => {
                warn!(snapshot, "Latest snapshot no longer exists");
                None
            }
            Err(err) => {
                warn!(error = %err, snapshot, "Failed to get snapshot");
                None
            }
        }
    }

    async fn create_job(&self, spec: &Spec) -> Result<()> {
        let (ns, name) = (spec.namespace.as_str(), spec.name.as_str());
        let existing = self
            .ops
            .get_job(ns, name)
            .await
            .with_context(|_| KubeSnafu { msg: format!("failed to get job {ns}/{name}") })?;
        if existing.is_some() {
            debug!("Job already exists");
            return Ok(());
        }

        let job = build_job(spec, &self.config, self.handler.resource_type())?;
        match self.ops.create_job(&job).await {
            Err(err) if !is_already_exists(&err) => Err(err).with_context(|_| KubeSnafu {
                msg: format!("failed to create job {ns}/{name}"),
            }),
            _ => Ok(()),
        }
    }

    async fn create_volume_snapshot(&self, spec: &Spec) -> Result<()> {
        let (ns, name) = (spec.namespace.as_str(), spec.name.as_str());
        let existing = self.ops.get_volume_snapshot(ns, name).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get volume snapshot {ns}/{name}"),
        })?;
        if existing.is_some() {
            debug!("VolumeSnapshot already exists");
            return Ok(());
        }

        let snapshot = build_volume_snapshot(spec, &self.config, self.handler.resource_type())?;
        match self.ops.create_volume_snapshot(&snapshot).await {
            Err(err) if !is_already_exists(&err) => Err(err).with_context(|_| KubeSnafu {
                msg: format!("failed to create volume snapshot {ns}/{name}"),
            }),
            _ => Ok(()),
        }
    }

    /// The downloader ServiceAccount in `ns`, bound to the registry reader ClusterRole.
    async fn ensure_service_account(&self, ns: &str) -> Result<()> {
        let sa_name = self.config.service_account.as_str();
        let sa = self.ops.get_service_account(ns, sa_name).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get service account {ns}/{sa_name}"),
        })?;
        if sa.is_none() {
            let sa = build_service_account(ns, &self.config)?;
            match self.ops.create_service_account(&sa).await {
                Err(err) if !is_already_exists(&err) => {
                    return Err(err).with_context(|_| KubeSnafu {
                        msg: format!("failed to create service account {ns}/{sa_name}"),
                    })
                }
                _ => debug!(ns, sa_name, "Created ServiceAccount"),
            }
        }

        let crb_name = self.config.cluster_role_binding.as_str();
        let crb = self.ops.get_cluster_role_binding(crb_name).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get cluster role binding {crb_name}"),
        })?;
        match crb {
            None => {
                let crb = build_cluster_role_binding(ns, &self.config)?;
                match self.ops.create_cluster_role_binding(&crb).await {
                    Err(err) if !is_already_exists(&err) => {
                        return Err(err).with_context(|_| KubeSnafu {
                            msg: format!("failed to create cluster role binding {crb_name}"),
                        })
                    }
                    _ => debug!(crb_name, "Created ClusterRoleBinding"),
                }
            }
            Some(mut crb) => {
                // Shared by every namespace, add this namespace's account if it's missing
                let subject = service_account_subject(ns, &self.config);
                let subjects = crb.subjects.get_or_insert_with(Vec::new);
                let bound = subjects.iter().any(|x| {
                    x.kind == subject.kind
                        && x.name == subject.name
                        && x.namespace == subject.namespace
                });
                if !bound {
                    subjects.push(subject);
                    self.ops.update_cluster_role_binding(&crb).await.with_context(|_| {
                        KubeSnafu { msg: format!("failed to update {crb_name}") }
                    })?;
                    debug!(crb_name, ns, "Added ServiceAccount to ClusterRoleBinding");
                }
            }
        }

        Ok(())
    }
}

/// Deletions during cleanup are best effort. Already gone is fine, anything else is logged.
pub(super) fn log_cleanup(kind: &'static str, name: &str, res: Result<(), kube::Error>) {
    match res {
        Ok(()) => info!(kind, name, "Deleted"),
        Err(err) if is_not_found(&err) => debug!(kind, name, "Already deleted"),
        Err(err) => warn!(kind, name, error = %err, "Failed to delete"),
    }
}
