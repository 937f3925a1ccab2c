//! Object storage behind a [`Registry`](crate::crd::Registry). Only the two reads the operator
//! needs are exposed: total size under a prefix and whether a directory exists.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt as _, TryStreamExt as _};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use object_store::{aws::AmazonS3Builder, path::Path, ObjectStore};
use snafu::{OptionExt as _, ResultExt as _};
use tracing::debug;

use crate::{
    crd::{BackendType, Registry},
    BackendSnafu, KubeSnafu, MissingFieldSnafu, Result,
};

static ACCESS_KEY_ID: &str = "accessKeyID";
static ACCESS_KEY_SECRET: &str = "accessKeySecret";
// Every registry bucket lives in the same region as far as MinIO cares
static DEFAULT_REGION: &str = "us-east-1";

#[async_trait]
pub trait Backend: Send + Sync {
    /// Size of the object at `prefix`, or the summed size of everything below it.
    async fn get_size(&self, prefix: &str) -> Result<i64>;

    /// Whether any object lives at or below `path`.
    async fn directory_exists(&self, path: &str) -> Result<bool>;
}

/// [`Backend`] over any `object_store` implementation.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    async fn get_size(&self, prefix: &str) -> Result<i64> {
        let path = Path::from(prefix);
        if let Ok(meta) = self.store.head(&path).await {
            return Ok(i64::try_from(meta.size).unwrap_or(i64::MAX));
        }

        let total = self
            .store
            .list(Some(&path))
            .try_fold(0_i64, |total, meta| async move {
                Ok(total.saturating_add(i64::try_from(meta.size).unwrap_or(i64::MAX)))
            })
            .await
            .with_context(|_| BackendSnafu { msg: format!("failed to list {prefix}") })?;
        debug!(prefix, total, "Calculated content size");
        Ok(total)
    }

    async fn directory_exists(&self, path: &str) -> Result<bool> {
        let path = Path::from(path);
        match self.store.list(Some(&path)).next().await {
            None => Ok(false),
            Some(Ok(_)) => Ok(true),
            Some(Err(source)) => {
                Err(source).with_context(|_| BackendSnafu { msg: format!("failed to list {path}") })
            }
        }
    }
}

/// Resolves Registry objects into backends, reading access keys from the registry secret
/// namespace.
#[derive(Clone)]
pub struct RegistryManager {
    client: Client,
    secret_namespace: String,
}

impl RegistryManager {
    pub fn new(client: Client, secret_namespace: impl Into<String>) -> Self {
        Self { client, secret_namespace: secret_namespace.into() }
    }

    pub async fn backend_from_registry(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let registries: Api<Registry> = Api::all(self.client.clone());
        let registry = registries
            .get(name)
            .await
            .with_context(|_| KubeSnafu { msg: format!("failed to get registry {name}") })?;
        self.backend(&registry).await
    }

    pub async fn backend(&self, registry: &Registry) -> Result<Arc<dyn Backend>> {
        let secret_name = &registry.spec.s3_config.access_credential_secret_name;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.secret_namespace);
        let secret = secrets.get(secret_name).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get secret {}/{secret_name}", self.secret_namespace),
        })?;
        let (key_id, key_secret) = access_keys(&secret, secret_name)?;

        match registry.spec.backend_type {
            BackendType::S3 => {
                let s3 = &registry.spec.s3_config;
                let store = AmazonS3Builder::new()
                    .with_endpoint(s3.endpoint_url())
                    .with_allow_http(!s3.use_ssl)
                    .with_bucket_name(&s3.bucket)
                    .with_region(DEFAULT_REGION)
                    .with_access_key_id(key_id)
                    .with_secret_access_key(key_secret)
                    .build()
                    .with_context(|_| BackendSnafu {
                        msg: format!("failed to create backend client for bucket {}", s3.bucket),
                    })?;
                Ok(Arc::new(ObjectStoreBackend::new(Arc::new(store))))
            }
        }
    }
}

fn access_keys(secret: &Secret, name: &str) -> Result<(String, String)> {
    let field = |key: &'static str| {
        secret
            .data
            .as_ref()
            .and_then(|x| x.get(key))
            .map(|x| String::from_utf8_lossy(&x.0).into_owned())
            .with_context(|| MissingFieldSnafu { kind: "Secret", name, field: key })
    };
    Ok((field(ACCESS_KEY_ID)?, field(ACCESS_KEY_SECRET)?))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::ByteString;
    use maplit::btreemap;
    use object_store::{memory::InMemory, PutPayload};

    use super::*;

    async fn store() -> ObjectStoreBackend {
        let store = InMemory::new();
        for (path, len) in [
            ("datasets/team-a/squad/v1/train.json", 100),
            ("datasets/team-a/squad/v1/test.json", 20),
            ("datasets/team-a/squad/v2/train.json", 7),
        ] {
            let payload = PutPayload::from(vec![0_u8; len]);
            store.put(&Path::from(path), payload).await.unwrap();
        }
        ObjectStoreBackend::new(Arc::new(store))
    }

    #[tokio::test]
    async fn sizes_files_and_directories() {
        let backend = store().await;
        assert_eq!(backend.get_size("datasets/team-a/squad/v1").await.unwrap(), 120);
        assert_eq!(backend.get_size("datasets/team-a/squad").await.unwrap(), 127);
        assert_eq!(backend.get_size("datasets/team-a/squad/v2/train.json").await.unwrap(), 7);
        assert_eq!(backend.get_size("datasets/team-a/missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn directory_existence() {
        let backend = store().await;
        assert!(backend.directory_exists("datasets/team-a/squad/v2").await.unwrap());
        assert!(!backend.directory_exists("datasets/team-a/squad/v3").await.unwrap());
        // Path segments, not string prefixes
        assert!(!backend.directory_exists("datasets/team-a/squad/v").await.unwrap());
    }

    #[test]
    fn access_keys_come_from_secret_data() {
        let secret = Secret {
            data: Some(btreemap! {
                ACCESS_KEY_ID.to_string() => ByteString(b"minio".to_vec()),
                ACCESS_KEY_SECRET.to_string() => ByteString(b"minio123".to_vec()),
            }),
            ..Default::default()
        };
        assert_eq!(
            access_keys(&secret, "creds").unwrap(),
            ("minio".to_string(), "minio123".to_string())
        );

        let err = access_keys(&Secret::default(), "creds").unwrap_err();
        assert_eq!(err.to_string(), "Secret creds is missing accessKeyID");
    }
}
