use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobStatus},
        core::v1::{PersistentVolumeClaim, ServiceAccount},
        rbac::v1::ClusterRoleBinding,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time},
};
use kube::{core::ErrorResponse, ResourceExt};
use llmos_operator::{
    config::SnapshottingConfig,
    crd::{
        SnapshottingPhase, SnapshottingStatus, VolumeSnapshot, VolumeSnapshotError,
        VolumeSnapshotStatus, LOCAL_MODEL_NAME_LABEL, LOCAL_MODEL_VERSION_RESOURCE,
    },
    snapshotting::{JobSpec, KubeOps, Manager, PvcSpec, ResourceHandler, Spec},
    AppError, Result,
};
use maplit::btreemap;
use test_context::AsyncTestContext;

pub const NS: &str = "default";

type Key = (String, String);

fn key<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("fake {reason}"),
        reason: reason.into(),
        code,
    })
}

#[derive(Default)]
pub struct ClusterState {
    pub pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    pub jobs: BTreeMap<Key, Job>,
    pub snapshots: BTreeMap<Key, VolumeSnapshot>,
    pub service_accounts: BTreeMap<Key, ServiceAccount>,
    pub cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    /// Successful creates per kind
    pub creates: BTreeMap<&'static str, usize>,
    /// `(kind, name)` of every successful delete
    pub deleted: Vec<(&'static str, String)>,
    /// Creates of these kinds fail with the given status code
    pub failing_creates: BTreeMap<&'static str, u16>,
}

/// In-memory API server for the objects the snapshotting workflow touches.
#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn creates(&self, kind: &str) -> usize {
        self.state.lock().unwrap().creates.get(kind).copied().unwrap_or(0)
    }

    pub fn deleted(&self) -> Vec<(&'static str, String)> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn fail_creates(&self, kind: &'static str, code: u16) {
        self.state.lock().unwrap().failing_creates.insert(kind, code);
    }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.state.lock().unwrap().pvcs.get(&(NS.to_string(), name.to_string())).cloned()
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(&(NS.to_string(), name.to_string())).cloned()
    }

    pub fn snapshot(&self, name: &str) -> Option<VolumeSnapshot> {
        self.state.lock().unwrap().snapshots.get(&(NS.to_string(), name.to_string())).cloned()
    }

    pub fn cluster_role_binding(&self, name: &str) -> Option<ClusterRoleBinding> {
        self.state.lock().unwrap().cluster_role_bindings.get(name).cloned()
    }

    pub fn put_snapshot(&self, snapshot: VolumeSnapshot) {
        self.state.lock().unwrap().snapshots.insert(key(&snapshot), snapshot);
    }

    fn create<K: ResourceExt + Clone>(
        &self, kind: &'static str, obj: &K,
        store: impl FnOnce(&mut ClusterState) -> &mut BTreeMap<Key, K>,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.failing_creates.get(kind) {
            return Err(api_error(*code, "InternalError"));
        }
        let objects = store(&mut *state);
        if objects.contains_key(&key(obj)) {
            return Err(api_error(409, "AlreadyExists"));
        }
        objects.insert(key(obj), obj.clone());
        *state.creates.entry(kind).or_default() += 1;
        Ok(())
    }

    fn delete<K>(
        &self, kind: &'static str, ns: &str, name: &str,
        store: impl FnOnce(&mut ClusterState) -> &mut BTreeMap<Key, K>,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        match store(&mut *state).remove(&(ns.to_string(), name.to_string())) {
            Some(_) => {
                state.deleted.push((kind, name.to_string()));
                Ok(())
            }
            None => Err(api_error(404, "NotFound")),
        }
    }

    fn get<K: Clone>(
        &self, ns: &str, name: &str, store: impl FnOnce(&ClusterState) -> &BTreeMap<Key, K>,
    ) -> Result<Option<K>, kube::Error> {
        let state = self.state.lock().unwrap();
        Ok(store(&*state).get(&(ns.to_string(), name.to_string())).cloned())
    }
}

#[async_trait]
impl KubeOps for FakeCluster {
    async fn get_pvc(&self, ns: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>, kube::Error> {
        self.get(ns, name, |x| &x.pvcs)
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), kube::Error> {
        self.create("PersistentVolumeClaim", pvc, |x| &mut x.pvcs)
    }

    async fn delete_pvc(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        self.delete("PersistentVolumeClaim", ns, name, |x| &mut x.pvcs)
    }

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        self.get(ns, name, |x| &x.jobs)
    }

    async fn create_job(&self, job: &Job) -> Result<(), kube::Error> {
        self.create("Job", job, |x| &mut x.jobs)
    }

    async fn update_job(&self, job: &Job) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(&key(job)) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(api_error(404, "NotFound")),
        }
    }

    async fn delete_job(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        self.delete("Job", ns, name, |x| &mut x.jobs)
    }

    async fn get_volume_snapshot(&self, ns: &str, name: &str)
        -> Result<Option<VolumeSnapshot>, kube::Error> {
        self.get(ns, name, |x| &x.snapshots)
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), kube::Error> {
        self.create("VolumeSnapshot", snapshot, |x| &mut x.snapshots)
    }

    async fn delete_volume_snapshot(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        self.delete("VolumeSnapshot", ns, name, |x| &mut x.snapshots)
    }

    async fn get_service_account(&self, ns: &str, name: &str)
        -> Result<Option<ServiceAccount>, kube::Error> {
        self.get(ns, name, |x| &x.service_accounts)
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), kube::Error> {
        self.create("ServiceAccount", sa, |x| &mut x.service_accounts)
    }

    async fn get_cluster_role_binding(&self, name: &str)
        -> Result<Option<ClusterRoleBinding>, kube::Error> {
        Ok(self.state.lock().unwrap().cluster_role_bindings.get(name).cloned())
    }

    async fn create_cluster_role_binding(&self, crb: &ClusterRoleBinding)
        -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        if state.cluster_role_bindings.contains_key(&crb.name_any()) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.cluster_role_bindings.insert(crb.name_any(), crb.clone());
        *state.creates.entry("ClusterRoleBinding").or_default() += 1;
        Ok(())
    }

    async fn update_cluster_role_binding(&self, crb: &ClusterRoleBinding)
        -> Result<(), kube::Error> {
        self.state.lock().unwrap().cluster_role_bindings.insert(crb.name_any(), crb.clone());
        Ok(())
    }
}

/// Owning resource kept in memory, keyed by name within [`NS`].
#[derive(Default)]
pub struct FakeHandler {
    pub statuses: Mutex<BTreeMap<String, SnapshottingStatus>>,
    pub content_size: Mutex<i64>,
    pub latest_snapshot: Mutex<Option<String>>,
    pub status_writes: Mutex<usize>,
    /// The next status write fails with this status code
    pub rejected_update: Mutex<Option<u16>>,
    /// Owners that were deleted
    pub missing: Mutex<BTreeSet<String>>,
}

impl FakeHandler {
    pub fn status(&self, name: &str) -> SnapshottingStatus {
        self.statuses.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    pub fn set_status(&self, name: &str, status: SnapshottingStatus) {
        self.statuses.lock().unwrap().insert(name.to_string(), status);
    }

    pub fn phase(&self, name: &str) -> SnapshottingPhase {
        self.status(name).current_phase()
    }

    pub fn writes(&self) -> usize {
        *self.status_writes.lock().unwrap()
    }

    pub fn reject_next_update(&self, code: u16) {
        *self.rejected_update.lock().unwrap() = Some(code);
    }

    pub fn delete_owner(&self, name: &str) {
        self.missing.lock().unwrap().insert(name.to_string());
    }

    fn not_found(&self, name: &str) -> Result<()> {
        if !self.missing.lock().unwrap().contains(name) {
            return Ok(());
        }
        Err(AppError::KubeError {
            msg: format!("failed to get LocalModelVersion {NS}/{name}"),
            source: api_error(404, "NotFound"),
        })
    }
}

#[async_trait]
impl ResourceHandler for FakeHandler {
    async fn get_snapshotting_status(&self, _ns: &str, name: &str) -> Result<SnapshottingStatus> {
        self.not_found(name)?;
        Ok(self.status(name))
    }

    async fn update_snapshotting_status(
        &self, _ns: &str, name: &str, status: Option<&SnapshottingStatus>,
    ) -> Result<()> {
        self.not_found(name)?;
        if let Some(code) = self.rejected_update.lock().unwrap().take() {
            return Err(AppError::KubeError {
                msg: format!("failed to update LocalModelVersion {NS}/{name}"),
                source: api_error(code, "Conflict"),
            });
        }
        *self.status_writes.lock().unwrap() += 1;
        let mut statuses = self.statuses.lock().unwrap();
        match status {
            Some(status) => statuses.insert(name.to_string(), status.clone()),
            None => statuses.remove(name),
        };
        Ok(())
    }

    async fn get_content_size(&self, _ns: &str, _name: &str) -> Result<i64> {
        Ok(*self.content_size.lock().unwrap())
    }

    async fn get_latest_ready_snapshot(&self, _ns: &str, _owner: &str) -> Result<Option<String>> {
        Ok(self.latest_snapshot.lock().unwrap().clone())
    }

    fn resource_type(&self) -> &str {
        LOCAL_MODEL_VERSION_RESOURCE
    }
}

pub struct SnapshotContext {
    pub cluster: Arc<FakeCluster>,
    pub handler: Arc<FakeHandler>,
    pub manager: Manager,
    pub config: SnapshottingConfig,
}

impl SnapshotContext {
    pub fn set_content_size(&self, size: i64) {
        *self.handler.content_size.lock().unwrap() = size;
    }

    /// Spec of LocalModelVersion `name` belonging to LocalModel `qwen`.
    pub fn spec(&self, name: &str) -> Spec {
        Spec {
            namespace: NS.to_string(),
            name: name.to_string(),
            labels: btreemap! { LOCAL_MODEL_NAME_LABEL.to_string() => "qwen".to_string() },
            owner_references: Vec::new(),
            pvc_spec: PvcSpec {
                access_modes: vec!["ReadWriteOnce".into()],
                restore_from_latest_snapshot: true,
                owner_label: Some(LOCAL_MODEL_NAME_LABEL.to_string()),
                ..Default::default()
            },
            job_spec: JobSpec {
                backoff_limit: Some(1),
                ttl_seconds_after_finished: None,
                image: "ghcr.io/llmos-ai/model-downloader:test".into(),
                args: vec!["--name=qwen/qwen2.5-0.5b".into()],
            },
        }
    }

    /// The stored Job with its status set as the Job controller would.
    pub fn job_with_status(&self, name: &str, status: JobStatus) -> Job {
        let mut job = self.cluster.job(name).expect("job was created");
        job.status = Some(status);
        self.cluster.state.lock().unwrap().jobs.insert(key(&job), job.clone());
        job
    }

    pub fn succeed_job(&self, name: &str) -> Job {
        self.job_with_status(
            name,
            JobStatus {
                succeeded: Some(1),
                start_time: Some(Time(Utc::now())),
                ..Default::default()
            },
        )
    }

    pub fn fail_job(&self, name: &str) -> Job {
        self.job_with_status(
            name,
            JobStatus {
                failed: Some(2),
                start_time: Some(Time(Utc::now())),
                ..Default::default()
            },
        )
    }

    pub fn stall_job(&self, name: &str, running_for: Duration) -> Job {
        self.job_with_status(
            name,
            JobStatus {
                active: Some(1),
                start_time: Some(Time(Utc::now() - running_for)),
                ..Default::default()
            },
        )
    }

    /// The stored VolumeSnapshot with the given readiness.
    pub fn settle_snapshot(&self, name: &str, status: VolumeSnapshotStatus) -> VolumeSnapshot {
        let mut snapshot = self.cluster.snapshot(name).expect("snapshot was created");
        snapshot.status = Some(status);
        self.cluster.put_snapshot(snapshot.clone());
        snapshot
    }

    pub fn ready_snapshot(&self, name: &str) -> VolumeSnapshot {
        self.settle_snapshot(name, ready_status("6Gi"))
    }

    pub fn broken_snapshot(&self, name: &str, message: &str) -> VolumeSnapshot {
        self.settle_snapshot(
            name,
            VolumeSnapshotStatus {
                ready_to_use: Some(false),
                error: Some(VolumeSnapshotError {
                    message: Some(message.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    /// Drive `name` from an empty status to `phase` with the fake cluster answering.
    pub async fn advance_to(&self, name: &str, phase: SnapshottingPhase) {
        let spec = self.spec(name);
        for _ in 0..10 {
            if self.handler.phase(name) == phase {
                return;
            }
            match self.handler.phase(name) {
                SnapshottingPhase::Downloading => {
                    let job = self.succeed_job(name);
                    self.manager.on_job_change(&job).await.unwrap();
                }
                SnapshottingPhase::Snapshotting => {
                    let snapshot = self.ready_snapshot(name);
                    self.manager.on_volume_snapshot_change(&snapshot).await.unwrap();
                }
                _ => self.manager.do_snapshot(&spec).await.unwrap(),
            }
        }
        panic!("{name} never reached {phase}, stuck in {}", self.handler.phase(name));
    }
}

pub fn ready_status(restore_size: &str) -> VolumeSnapshotStatus {
    VolumeSnapshotStatus {
        ready_to_use: Some(true),
        restore_size: Some(Quantity(restore_size.to_string())),
        ..Default::default()
    }
}

#[async_trait]
impl AsyncTestContext for SnapshotContext {
    async fn setup() -> Self {
        llmos_operator::telemetry::init();

        let cluster = Arc::new(FakeCluster::default());
        let handler = Arc::new(FakeHandler::default());
        let config = SnapshottingConfig::default();
        let manager = Manager::new(cluster.clone(), handler.clone(), config.clone());
        SnapshotContext { cluster, handler, manager, config }
    }
}
