use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Object storage that datasets and models are stored in.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(kind = "Registry", group = "ml.llmos.ai", version = "v1")]
#[kube(status = "RegistryStatus", shortname = "registry")]
#[kube(
    printcolumn = r#"{"name":"Backend", "type":"string", "jsonPath":".spec.backendType"}"#
)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    pub backend_type: BackendType,

    #[serde(default)]
    pub s3_config: S3Config,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub enum BackendType {
    #[default]
    S3,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    /// Whether to talk to the endpoint over https.
    #[serde(rename = "useSSL", default)]
    pub use_ssl: bool,

    /// host[:port] of the S3 compatible endpoint, without scheme.
    pub endpoint: String,

    pub bucket: String,

    /// Secret holding `accessKeyID` and `accessKeySecret`.
    pub access_credential_secret_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl S3Config {
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.endpoint)
    }
}
