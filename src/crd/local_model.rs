use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::SnapshottingStatus;

pub static LOCAL_MODEL_VERSION_RESOURCE: &str = "localmodelversions";
pub static LOCAL_MODEL_VERSION_FINALIZER: &str = "ml.llmos.ai/local-model-version";

// Set by admission on every LocalModelVersion
pub static LOCAL_MODEL_NAME_LABEL: &str = "llmos.ai/local-model-name";
pub static REGISTRY_NAME_LABEL: &str = "llmos.ai/registry-name";
pub static MODEL_NAME_LABEL: &str = "llmos.ai/model-name";
pub static MODEL_NAMESPACE_LABEL: &str = "llmos.ai/model-namespace";

/// A model from a registry cached on local storage. Acts as the parent of its
/// LocalModelVersions.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "LocalModel", group = "ml.llmos.ai", version = "v1", namespaced)]
#[kube(status = "LocalModelStatus", shortname = "lm")]
#[kube(printcolumn = r#"{"name":"Registry", "type":"string", "jsonPath":".spec.registry"}"#)]
#[kube(printcolumn = r#"{"name":"ModelName", "type":"string", "jsonPath":".spec.modelName"}"#)]
#[kube(
    printcolumn = r#"{"name":"DefaultVersion", "type":"integer", "jsonPath":".status.defaultVersion"}"#
)]
#[kube(
    printcolumn = r#"{"name":"DefaultVersionName", "type":"string", "jsonPath":".status.defaultVersionName"}"#
)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelSpec {
    pub registry: String,

    /// `<namespace>/<name>` of the Model in the registry, e.g. deepseek-ai/deepseek-r1
    pub model_name: String,

    /// Name of the LocalModelVersion to use. Empty means the latest ready version.
    #[serde(default)]
    pub default_version: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub default_version: u64,

    #[serde(default)]
    pub default_version_name: String,

    /// Highest version number handed out to a LocalModelVersion so far.
    #[serde(default)]
    pub latest_version: u64,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "LocalModelVersion", group = "ml.llmos.ai", version = "v1", namespaced)]
#[kube(status = "LocalModelVersionStatus", shortname = "lmv")]
#[kube(printcolumn = r#"{"name":"LocalModel", "type":"string", "jsonPath":".spec.localModel"}"#)]
#[kube(printcolumn = r#"{"name":"Version", "type":"integer", "jsonPath":".status.version"}"#)]
#[kube(
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.snapshottingStatus.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"VolumeSnapshot", "type":"string", "jsonPath":".status.volumeSnapshot"}"#
)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelVersionSpec {
    pub local_model: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelVersionStatus {
    /// Assigned once, increasing per LocalModel. 0 means not assigned yet.
    #[serde(default)]
    pub version: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_snapshot: String,

    #[serde(default)]
    pub snapshotting_status: SnapshottingStatus,
}

/// Registry coordinates of a Model, `model_name` being `<namespace>/<name>`.
pub fn split_model_name(model_name: &str) -> Option<(&str, &str)> {
    match model_name.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Some((ns, name))
        }
        _ => None,
    }
}
