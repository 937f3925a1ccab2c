use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(default)]
pub struct AppConfig {
    /// Fixed names and timings used by the snapshotting workflow.
    pub snapshotting: SnapshottingConfig,

    /// Image of the container that downloads model files from a registry into the PVC.
    pub model_downloader_image: String,

    /// Image of the container that downloads dataset files from a registry into the PVC.
    pub dataset_downloader_image: String,

    /// Namespace holding the access credential secrets referenced by Registries.
    pub registry_secret_namespace: String,

    /// Address the metrics and health endpoints listen on.
    pub metrics_address: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            snapshotting: SnapshottingConfig::default(),
            model_downloader_image: "ghcr.io/llmos-ai/llmos-operator-downloader:latest".into(),
            dataset_downloader_image: "ghcr.io/llmos-ai/llmos-operator-downloader:latest".into(),
            registry_secret_namespace: "llmos-system".into(),
            metrics_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(default)]
pub struct SnapshottingConfig {
    /// storageClass of the PVCs the download Jobs write into.
    pub storage_class: String,

    /// volumeSnapshotClass used when snapshotting a downloaded PVC.
    pub volume_snapshot_class: String,

    /// ServiceAccount the download Jobs run as, created in each namespace on demand.
    pub service_account: String,

    pub cluster_role_binding: String,

    /// ClusterRole granting the downloader read access to registries and their secrets.
    pub cluster_role: String,

    /// Seconds a download Job may run (from its startTime) before it's treated as failed.
    pub job_timeout_secs: u64,

    /// ttlSecondsAfterFinished set on failed Jobs so they stay around for inspection.
    pub failed_job_ttl_secs: i32,
}

impl Default for SnapshottingConfig {
    fn default() -> Self {
        Self {
            storage_class: "llmos-ceph-block".into(),
            volume_snapshot_class: "llmos-ceph-block-snapshot-class".into(),
            service_account: "llmos-operator-downloader".into(),
            cluster_role_binding: "llmos-operator".into(),
            cluster_role: "llmos-operator-registry-reader".into(),
            job_timeout_secs: 60 * 60,
            failed_job_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl SnapshottingConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
