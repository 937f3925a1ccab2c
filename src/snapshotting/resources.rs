use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{PersistentVolumeClaim, ServiceAccount},
    rbac::v1::{ClusterRoleBinding, Subject},
};
use serde_json::json;
use snafu::ResultExt as _;

use super::{Spec, RESOURCE_TYPE_LABEL, SNAPSHOT_MANAGER_LABEL, SNAPSHOT_MANAGER_VALUE};
use crate::{config::SnapshottingConfig, crd::VolumeSnapshot, Result, SerializationSnafu};

const DATA_VOLUME: &str = "data-volume";
const DATA_MOUNT_PATH: &str = "/data";

/// `Spec.labels` plus the two labels the Job and VolumeSnapshot watchers filter on.
pub fn managed_labels(
    labels: &BTreeMap<String, String>, resource_type: &str,
) -> BTreeMap<String, String> {
    let mut labels = labels.clone();
    labels.insert(SNAPSHOT_MANAGER_LABEL.into(), SNAPSHOT_MANAGER_VALUE.into());
    labels.insert(RESOURCE_TYPE_LABEL.into(), resource_type.into());
    labels
}

/// PVC the download Job writes into. `data_source` names a VolumeSnapshot to pre-populate it
/// from.
pub fn build_pvc(
    spec: &Spec, config: &SnapshottingConfig, storage: &str, data_source: Option<&str>,
) -> Result<PersistentVolumeClaim> {
    let mut pvc = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels,
            "ownerReferences": spec.owner_references,
        },
        "spec": {
            "storageClassName": config.storage_class,
            "accessModes": spec.pvc_spec.access_modes,
            "resources": {
                "requests": {
                    "storage": storage,
                }
            }
        }
    });

    if let Some(snapshot) = data_source {
        pvc["spec"]["dataSource"] = json!({
            "apiGroup": "snapshot.storage.k8s.io",
            "kind": "VolumeSnapshot",
            "name": snapshot,
        });
    }

    serde_json::from_value(pvc).context(SerializationSnafu)
}

/// Job running the downloader image against the PVC of the same name.
pub fn build_job(spec: &Spec, config: &SnapshottingConfig, resource_type: &str) -> Result<Job> {
    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": managed_labels(&spec.labels, resource_type),
            "ownerReferences": spec.owner_references,
        },
        "spec": {
            "backoffLimit": spec.job_spec.backoff_limit,
            // Failed jobs get a longer TTL from the Job watcher
            "ttlSecondsAfterFinished": spec.job_spec.ttl_seconds_after_finished.unwrap_or(0),
            "template": {
                "metadata": {
                    "labels": spec.labels,
                },
                "spec": {
                    "serviceAccountName": config.service_account,
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "downloader",
                        "image": spec.job_spec.image,
                        "args": spec.job_spec.args,
                        "volumeMounts": [{
                            "name": DATA_VOLUME,
                            "mountPath": DATA_MOUNT_PATH,
                        }],
                    }],
                    "volumes": [{
                        "name": DATA_VOLUME,
                        "persistentVolumeClaim": {
                            "claimName": spec.name,
                        },
                    }],
                }
            }
        }
    });

    serde_json::from_value(job).context(SerializationSnafu)
}

pub fn build_volume_snapshot(
    spec: &Spec, config: &SnapshottingConfig, resource_type: &str,
) -> Result<VolumeSnapshot> {
    let snapshot = json!({
        "apiVersion": "snapshot.storage.k8s.io/v1",
        "kind": "VolumeSnapshot",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": managed_labels(&spec.labels, resource_type),
            "ownerReferences": spec.owner_references,
        },
        "spec": {
            "volumeSnapshotClassName": config.volume_snapshot_class,
            "source": {
                "persistentVolumeClaimName": spec.name,
            }
        }
    });

    serde_json::from_value(snapshot).context(SerializationSnafu)
}

pub fn build_service_account(
    namespace: &str, config: &SnapshottingConfig,
) -> Result<ServiceAccount> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": config.service_account,
            "namespace": namespace,
            "labels": {
                SNAPSHOT_MANAGER_LABEL: SNAPSHOT_MANAGER_VALUE,
            },
        }
    }))
    .context(SerializationSnafu)
}

/// Binds the downloader ServiceAccount of `namespace` to the registry reader ClusterRole.
pub fn build_cluster_role_binding(
    namespace: &str, config: &SnapshottingConfig,
) -> Result<ClusterRoleBinding> {
    serde_json::from_value(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": {
            "name": config.cluster_role_binding,
            "labels": {
                SNAPSHOT_MANAGER_LABEL: SNAPSHOT_MANAGER_VALUE,
            },
        },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": config.cluster_role,
        },
        "subjects": [service_account_subject(namespace, config)],
    }))
    .context(SerializationSnafu)
}

pub(super) fn service_account_subject(namespace: &str, config: &SnapshottingConfig) -> Subject {
    Subject {
        kind: "ServiceAccount".into(),
        name: config.service_account.clone(),
        namespace: Some(namespace.into()),
        ..Default::default()
    }
}
