use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A model stored in a Registry. LocalModels cache one of these on cluster storage.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Model", group = "ml.llmos.ai", version = "v1", namespaced)]
#[kube(status = "ModelStatus", shortname = "model")]
#[kube(printcolumn = r#"{"name":"Registry", "type":"string", "jsonPath":".spec.registry"}"#)]
#[kube(printcolumn = r#"{"name":"Path", "type":"string", "jsonPath":".status.path"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub registry: String,

    #[serde(default)]
    pub model_card: Option<ModelCard>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelCard {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub framework: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Directory holding the model's files inside the registry bucket.
    #[serde(rename = "path", default)]
    pub root_path: String,
}
