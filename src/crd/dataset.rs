use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::SnapshottingStatus;

pub static DATASET_VERSION_RESOURCE: &str = "datasetversions";

/// Set by admission on every DatasetVersion, points at the parent Dataset.
pub static DATASET_NAME_LABEL: &str = "llmos.ai/dataset-name";
pub static DATASET_VERSION_LABEL: &str = "llmos.ai/dataset-version";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Dataset", group = "ml.llmos.ai", version = "v1", namespaced)]
#[kube(status = "DatasetStatus", shortname = "dataset")]
#[kube(printcolumn = r#"{"name":"Registry", "type":"string", "jsonPath":".spec.registry"}"#)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    pub registry: String,

    #[serde(default)]
    pub dataset_card: Option<DatasetCard>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetCard {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub license: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub root_path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<VersionRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionRef {
    pub version: String,
    pub object_name: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "DatasetVersion", group = "ml.llmos.ai", version = "v1", namespaced)]
#[kube(status = "DatasetVersionStatus", shortname = "dsv")]
#[kube(printcolumn = r#"{"name":"Dataset", "type":"string", "jsonPath":".spec.dataset"}"#)]
#[kube(printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#)]
#[kube(
    printcolumn = r#"{"name":"Publish", "type":"string", "jsonPath":".status.publishStatus.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"VolumeSnapshot", "type":"string", "jsonPath":".status.publishStatus.snapshotName"}"#
)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DatasetVersionSpec {
    pub dataset: String,

    /// Version label, conventionally `v<N>`.
    pub version: String,

    /// Publishing snapshots the version's files into a VolumeSnapshot so workloads can mount
    /// them. Turning it off removes the snapshot again.
    #[serde(default)]
    pub publish: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasetVersionStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub registry: String,

    #[serde(default)]
    pub root_path: String,

    #[serde(default)]
    pub publish_status: SnapshottingStatus,
}

impl DatasetVersionSpec {
    /// Numeric part of the version label, `v12` and `12` both give 12.
    pub fn version_number(&self) -> Option<u64> {
        self.version.trim_start_matches(['v', 'V']).parse().ok()
    }
}
