use async_trait::async_trait;
use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{PersistentVolumeClaim, ServiceAccount},
    rbac::v1::ClusterRoleBinding,
};
use kube::{
    api::{DeleteParams, PostParams, PropagationPolicy},
    Api, Client, Resource, ResourceExt as _,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::crd::VolumeSnapshot;

/// The Kubernetes calls the snapshotting workflow makes. `get_*` return `Ok(None)` for objects
/// that don't exist; every other failure, including not-found on delete, is returned as is.
#[async_trait]
pub trait KubeOps: Send + Sync {
    async fn get_pvc(&self, ns: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>, kube::Error>;
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), kube::Error>;
    async fn delete_pvc(&self, ns: &str, name: &str) -> Result<(), kube::Error>;

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>, kube::Error>;
    async fn create_job(&self, job: &Job) -> Result<(), kube::Error>;
    /// Replace the Job. The write is rejected when `job` carries a stale resourceVersion.
    async fn update_job(&self, job: &Job) -> Result<(), kube::Error>;
    async fn delete_job(&self, ns: &str, name: &str) -> Result<(), kube::Error>;

    async fn get_volume_snapshot(&self, ns: &str, name: &str)
        -> Result<Option<VolumeSnapshot>, kube::Error>;
    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), kube::Error>;
    async fn delete_volume_snapshot(&self, ns: &str, name: &str) -> Result<(), kube::Error>;

    async fn get_service_account(&self, ns: &str, name: &str)
        -> Result<Option<ServiceAccount>, kube::Error>;
    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), kube::Error>;

    async fn get_cluster_role_binding(&self, name: &str)
        -> Result<Option<ClusterRoleBinding>, kube::Error>;
    async fn create_cluster_role_binding(&self, crb: &ClusterRoleBinding)
        -> Result<(), kube::Error>;
    async fn update_cluster_role_binding(&self, crb: &ClusterRoleBinding)
        -> Result<(), kube::Error>;
}

/// The API server said the object doesn't exist.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// A create raced with another writer and lost.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}

/// An update carried a stale resourceVersion.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason != "AlreadyExists")
}

/// [`KubeOps`] against a live API server.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, ns: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), ns)
    }
}

async fn create_in<K>(api: Api<K>, obj: &K) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    api.create(&PostParams::default(), obj).await.map(|_| ())
}

async fn replace_in<K>(api: Api<K>, obj: &K) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    api.replace(&obj.name_any(), &PostParams::default(), obj).await.map(|_| ())
}

fn background() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

#[async_trait]
impl KubeOps for KubeClient {
    async fn get_pvc(&self, ns: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>, kube::Error> {
        self.namespaced::<PersistentVolumeClaim>(ns).get_opt(name).await
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), kube::Error> {
        let ns = pvc.namespace().unwrap_or_default();
        create_in(self.namespaced(&ns), pvc).await
    }

    async fn delete_pvc(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        self.namespaced::<PersistentVolumeClaim>(ns)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        self.namespaced::<Job>(ns).get_opt(name).await
    }

    async fn create_job(&self, job: &Job) -> Result<(), kube::Error> {
        let ns = job.namespace().unwrap_or_default();
        create_in(self.namespaced(&ns), job).await
    }

    async fn update_job(&self, job: &Job) -> Result<(), kube::Error> {
        let ns = job.namespace().unwrap_or_default();
        replace_in(self.namespaced(&ns), job).await
    }

    async fn delete_job(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        // Jobs orphan their pods unless told otherwise
        self.namespaced::<Job>(ns).delete(name, &background()).await.map(|_| ())
    }

    async fn get_volume_snapshot(&self, ns: &str, name: &str)
        -> Result<Option<VolumeSnapshot>, kube::Error> {
        self.namespaced::<VolumeSnapshot>(ns).get_opt(name).await
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), kube::Error> {
        let ns = snapshot.namespace().unwrap_or_default();
        create_in(self.namespaced(&ns), snapshot).await
    }

    async fn delete_volume_snapshot(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        self.namespaced::<VolumeSnapshot>(ns)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn get_service_account(&self, ns: &str, name: &str)
        -> Result<Option<ServiceAccount>, kube::Error> {
        self.namespaced::<ServiceAccount>(ns).get_opt(name).await
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), kube::Error> {
        let ns = sa.namespace().unwrap_or_default();
        create_in(self.namespaced(&ns), sa).await
    }

    async fn get_cluster_role_binding(&self, name: &str)
        -> Result<Option<ClusterRoleBinding>, kube::Error> {
        Api::<ClusterRoleBinding>::all(self.client.clone()).get_opt(name).await
    }

    async fn create_cluster_role_binding(&self, crb: &ClusterRoleBinding)
        -> Result<(), kube::Error> {
        create_in(Api::all(self.client.clone()), crb).await
    }

    async fn update_cluster_role_binding(&self, crb: &ClusterRoleBinding)
        -> Result<(), kube::Error> {
        replace_in(Api::all(self.client.clone()), crb).await
    }
}
