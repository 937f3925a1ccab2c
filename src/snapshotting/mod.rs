//! Resource-agnostic PVC -> download Job -> VolumeSnapshot workflow.
//!
//! An owning controller calls [`Manager::do_snapshot`] on every reconcile. Each call looks at the
//! persisted [`SnapshottingStatus`](crate::crd::SnapshottingStatus) and performs at most one
//! step. Job and VolumeSnapshot controllers move the workflow past the `Downloading` and
//! `Snapshotting` phases, requeueing any change they fail to apply. Owning resource kinds plug
//! in through [`ResourceHandler`].

mod events;
mod kube_ops;
mod manager;
mod resources;
mod size;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

pub use events::{error_policy, is_job_timed_out, job_timeout_check, EVENT_RETRY};
pub use kube_ops::{is_already_exists, is_conflict, is_not_found, KubeClient, KubeOps};
pub use manager::Manager;
pub use resources::{
    build_cluster_role_binding, build_job, build_pvc, build_service_account, build_volume_snapshot,
    managed_labels,
};
pub use size::{calculate_pvc_size, parse_quantity, GIB};

use crate::{crd::SnapshottingStatus, Result};

/// Marks Jobs and VolumeSnapshots created by a snapshotting [`Manager`].
pub static SNAPSHOT_MANAGER_LABEL: &str = "llmos.ai/snapshotting-manager";
pub static SNAPSHOT_MANAGER_VALUE: &str = "true";
/// Which owning resource kind a managed Job or VolumeSnapshot belongs to.
pub static RESOURCE_TYPE_LABEL: &str = "llmos.ai/resource-type";

/// Everything needed to create the PVC, Job and VolumeSnapshot of one run. Built by the owning
/// controller on every call.
#[derive(Clone, Debug, Default)]
pub struct Spec {
    pub namespace: String,
    /// Shared by the PVC, the Job and the VolumeSnapshot, and the name of the owning resource.
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    pub pvc_spec: PvcSpec,
    pub job_spec: JobSpec,
}

#[derive(Clone, Debug, Default)]
pub struct PvcSpec {
    /// Explicit storage request. Computed from the content size when empty.
    pub size: String,
    pub access_modes: Vec<String>,
    /// Populate the PVC from the owner's latest ready VolumeSnapshot so only new files are
    /// downloaded.
    pub restore_from_latest_snapshot: bool,
    /// Label whose value names the owner passed to
    /// [`ResourceHandler::get_latest_ready_snapshot`].
    pub owner_label: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct JobSpec {
    pub backoff_limit: Option<i32>,
    pub ttl_seconds_after_finished: Option<i32>,
    pub image: String,
    pub args: Vec<String>,
}

/// Implemented by every resource kind that owns a snapshotting workflow.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn get_snapshotting_status(&self, namespace: &str, name: &str)
        -> Result<SnapshottingStatus>;

    /// Persist `status`. `None` clears the status back to empty.
    async fn update_snapshotting_status(
        &self, namespace: &str, name: &str, status: Option<&SnapshottingStatus>,
    ) -> Result<()>;

    /// Bytes that will be downloaded. Zero means there is nothing to snapshot.
    async fn get_content_size(&self, namespace: &str, name: &str) -> Result<i64>;

    /// VolumeSnapshot of the owner's highest version that has one.
    async fn get_latest_ready_snapshot(&self, namespace: &str, owner: &str)
        -> Result<Option<String>>;

    /// Plural resource name, used to label created objects and name the watchers.
    fn resource_type(&self) -> &str;
}
