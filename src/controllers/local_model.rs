//! LocalModel and LocalModelVersion controllers.
//!
//! Each LocalModelVersion caches its model's files into a VolumeSnapshot, starting from the
//! previous version's snapshot so only changed files are downloaded. Version numbers are handed
//! out by bumping `status.latestVersion` on the parent LocalModel. The LocalModel controller
//! keeps `status.defaultVersion` pointed at the pinned version, or at the latest ready one.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future, StreamExt as _};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher, Controller,
    },
    Api, Client, Resource as _, ResourceExt as _,
};
use maplit::btreemap;
use serde_json::json;
use snafu::{OptionExt as _, ResultExt as _};
use tracing::{debug, info, instrument, warn};

use super::{error_policy, owner_references, status_body};
use crate::{
    config::AppConfig,
    crd::{
        is_ready, set_ready, set_ready_message, split_model_name, LocalModel, LocalModelVersion,
        LocalModelVersionStatus, Model, SnapshottingPhase, SnapshottingStatus,
        LOCAL_MODEL_NAME_LABEL, LOCAL_MODEL_VERSION_FINALIZER, LOCAL_MODEL_VERSION_RESOURCE,
        MODEL_NAMESPACE_LABEL, MODEL_NAME_LABEL, REGISTRY_NAME_LABEL,
    },
    registry::RegistryManager,
    snapshotting::{is_conflict, JobSpec, PvcSpec, ResourceHandler, Spec},
    Context, FinalizerSnafu, KubeSnafu, MissingFieldSnafu, Result, OPERATOR,
};

static MODEL_DIR: &str = "/data/models";
static JOB_TTL_SECS: i32 = 86400;
const VERSION_ASSIGN_ATTEMPTS: usize = 5;

/// Snapshotting hooks of LocalModelVersion. Progress lives in `status.snapshottingStatus` and
/// drives the version's Ready condition.
pub struct LocalModelVersionHandler {
    client: Client,
    registries: RegistryManager,
}

impl LocalModelVersionHandler {
    pub fn new(client: Client, registries: RegistryManager) -> Self {
        Self { client, registries }
    }

    fn api(&self, namespace: &str) -> Api<LocalModelVersion> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<LocalModelVersion> {
        self.api(namespace).get(name).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get LocalModelVersion {namespace}/{name}"),
        })
    }
}

#[async_trait]
impl ResourceHandler for LocalModelVersionHandler {
    async fn get_snapshotting_status(
        &self, namespace: &str, name: &str,
    ) -> Result<SnapshottingStatus> {
        let version = self.get(namespace, name).await?;
        Ok(version.status.map(|x| x.snapshotting_status).unwrap_or_default())
    }

    async fn update_snapshotting_status(
        &self, namespace: &str, name: &str, status: Option<&SnapshottingStatus>,
    ) -> Result<()> {
        let mut version = self.get(namespace, name).await?;
        let generation = version.meta().generation;
        apply_snapshotting_status(
            version.status.get_or_insert_with(Default::default),
            status,
            generation,
        );

        self.api(namespace)
            .replace_status(name, &PostParams::default(), status_body(&version)?)
            .await
            .with_context(|_| KubeSnafu {
                msg: format!("failed to update snapshotting status of {namespace}/{name}"),
            })?;
        Ok(())
    }

    async fn get_content_size(&self, namespace: &str, name: &str) -> Result<i64> {
        let version = self.get(namespace, name).await?;
        let label = |key: &'static str| {
            version.labels().get(key).cloned().with_context(|| MissingFieldSnafu {
                kind: "LocalModelVersion",
                name,
                field: key,
            })
        };
        let registry = label(REGISTRY_NAME_LABEL)?;
        let model_ns = label(MODEL_NAMESPACE_LABEL)?;
        let model_name = label(MODEL_NAME_LABEL)?;

        let models: Api<Model> = Api::namespaced(self.client.clone(), &model_ns);
        let model = models.get(&model_name).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get Model {model_ns}/{model_name}"),
        })?;
        let root_path = model.status.map(|x| x.root_path).unwrap_or_default();

        let backend = self.registries.backend_from_registry(&registry).await?;
        backend.get_size(&root_path).await
    }

    async fn get_latest_ready_snapshot(
        &self, namespace: &str, owner: &str,
    ) -> Result<Option<String>> {
        let versions = self
            .api(namespace)
            .list(&ListParams::default().labels(&format!("{LOCAL_MODEL_NAME_LABEL}={owner}")))
            .await
            .with_context(|_| KubeSnafu {
                msg: format!("failed to list versions of LocalModel {namespace}/{owner}"),
            })?;
        Ok(latest_snapshot(&versions.items))
    }

    fn resource_type(&self) -> &str {
        LOCAL_MODEL_VERSION_RESOURCE
    }
}

/// Mirror snapshotting progress into the version's Ready condition.
fn apply_snapshotting_status(
    status: &mut LocalModelVersionStatus, snapshotting: Option<&SnapshottingStatus>,
    generation: Option<i64>,
) {
    let Some(snapshotting) = snapshotting else {
        status.snapshotting_status = SnapshottingStatus::default();
        return;
    };
    status.snapshotting_status = snapshotting.clone();

    match snapshotting.current_phase() {
        SnapshottingPhase::SnapshotReady => {
            status.volume_snapshot = snapshotting.snapshot_name.clone();
            set_ready(
                &mut status.conditions,
                true,
                "SnapshotReady",
                "Volume snapshot is ready",
                generation,
            );
        }
        SnapshottingPhase::Failed => set_ready(
            &mut status.conditions,
            false,
            "SnapshotFailed",
            snapshotting.message.clone(),
            generation,
        ),
        phase => set_ready_message(&mut status.conditions, phase.as_str(), &snapshotting.message),
    }
}

/// Snapshot of the highest version that has one.
fn latest_snapshot(versions: &[LocalModelVersion]) -> Option<String> {
    versions
        .iter()
        .filter_map(|x| x.status.as_ref())
        .filter(|x| !x.volume_snapshot.is_empty())
        .max_by_key(|x| x.version)
        .map(|x| x.volume_snapshot.clone())
}

/// Latest ready version that isn't being deleted, as `(version, name)`.
fn latest_ready_version(versions: &[LocalModelVersion]) -> Option<(u64, String)> {
    versions
        .iter()
        .filter(|x| x.meta().deletion_timestamp.is_none())
        .filter_map(|x| {
            let status = x.status.as_ref()?;
            (status.version > 0 && is_ready(&status.conditions))
                .then(|| (status.version, x.name_any()))
        })
        .max_by_key(|(version, _)| *version)
}

/// Next version number for a LocalModel, never reusing one already handed out.
fn next_version(latest: u64, siblings: &[LocalModelVersion]) -> u64 {
    let highest = siblings.iter().filter_map(|x| x.status.as_ref()).map(|x| x.version).max();
    latest.max(highest.unwrap_or(0)) + 1
}

/// Snapshotting spec of one LocalModelVersion. `model` is the `(namespace, name)` of the Model
/// in the registry.
/// Version number already recorded on `version`. Zero means none.
fn recorded_version(version: &LocalModelVersion) -> Option<u64> {
    version.status.as_ref().map(|x| x.version).filter(|x| *x > 0)
}

/// Model to download, from the version's labels or else the parent's `spec.modelName`.
fn model_coordinates(
    version: &LocalModelVersion, parent: Option<&LocalModel>,
) -> Option<(String, String)> {
    let labels = version.labels();
    if let Some((ns, name)) = labels.get(MODEL_NAMESPACE_LABEL).zip(labels.get(MODEL_NAME_LABEL)) {
        return Some((ns.clone(), name.clone()));
    }
    let (ns, name) = split_model_name(&parent?.spec.model_name)?;
    Some((ns.to_string(), name.to_string()))
}

fn model_spec(
    version: &LocalModelVersion, namespace: &str, model: (&str, &str), config: &AppConfig,
) -> Spec {
    let local_model = &version.spec.local_model;
    let (model_ns, model_name) = model;

    Spec {
        namespace: namespace.to_string(),
        name: version.name_any(),
        labels: btreemap! { LOCAL_MODEL_NAME_LABEL.to_string() => local_model.clone() },
        owner_references: owner_references(version),
        pvc_spec: PvcSpec {
            access_modes: vec!["ReadWriteOnce".into()],
            restore_from_latest_snapshot: true,
            owner_label: Some(LOCAL_MODEL_NAME_LABEL.to_string()),
            ..Default::default()
        },
        job_spec: JobSpec {
            backoff_limit: Some(1),
            ttl_seconds_after_finished: Some(JOB_TTL_SECS),
            image: config.model_downloader_image.clone(),
            args: vec![
                format!("--name={model_ns}/{model_name}"),
                format!("--output-dir={MODEL_DIR}/{namespace}/{local_model}"),
                "--debug=true".to_string(),
            ],
        },
    }
}

impl LocalModelVersion {
    #[instrument(skip_all, fields(ns, name = %self.name_any()))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let ns = self.namespace().context(MissingFieldSnafu {
            kind: "LocalModelVersion",
            name: name.clone(),
            field: "metadata.namespace",
        })?;
        tracing::Span::current().record("ns", ns.as_str());

        let version = self.assign_version(&ctx, &ns).await?;
        debug!(version, "Reconciling LocalModelVersion");

        let labels = self.labels();
        let parent = if labels.contains_key(MODEL_NAMESPACE_LABEL)
            && labels.contains_key(MODEL_NAME_LABEL)
        {
            None
        } else {
            let local_model = &self.spec.local_model;
            Api::<LocalModel>::namespaced(ctx.client.clone(), &ns)
                .get_opt(local_model)
                .await
                .with_context(|_| KubeSnafu {
                    msg: format!("failed to get LocalModel {ns}/{local_model}"),
                })?
        };
        let (model_ns, model_name) =
            model_coordinates(self, parent.as_ref()).context(MissingFieldSnafu {
                kind: "LocalModelVersion",
                name: name.clone(),
                field: "metadata.labels",
            })?;

        let spec = model_spec(self, &ns, (model_ns.as_str(), model_name.as_str()), &ctx.config);
        ctx.local_model_snapshots.do_snapshot(&spec).await?;

        Ok(Action::requeue(Duration::from_secs(60 * 5)))
    }

    /// Version number of this LocalModelVersion, assigned on first reconcile.
    async fn assign_version(&self, ctx: &Context, ns: &str) -> Result<u64> {
        if let Some(version) = recorded_version(self) {
            return Ok(version);
        }

        let name = self.name_any();
        let local_model = &self.spec.local_model;
        let local_models: Api<LocalModel> = Api::namespaced(ctx.client.clone(), ns);
        let versions: Api<LocalModelVersion> = Api::namespaced(ctx.client.clone(), ns);

        // The cached copy can predate an earlier assignment
        let mut fresh = versions
            .get(&name)
            .await
            .with_context(|_| KubeSnafu { msg: "failed to get LocalModelVersion" })?;
        if let Some(version) = recorded_version(&fresh) {
            debug!(version, "Version already assigned");
            return Ok(version);
        }

        let siblings = versions
            .list(&ListParams::default().labels(&format!("{LOCAL_MODEL_NAME_LABEL}={local_model}")))
            .await
            .with_context(|_| KubeSnafu { msg: "failed to list LocalModelVersions" })?;

        let mut assigned = None;
        for attempt in 1..=VERSION_ASSIGN_ATTEMPTS {
            let mut parent = local_models.get(local_model).await.with_context(|_| KubeSnafu {
                msg: format!("failed to get LocalModel {ns}/{local_model}"),
            })?;
            let status = parent.status.get_or_insert_with(Default::default);
            let next = next_version(status.latest_version, &siblings.items);
            status.latest_version = next;

            match local_models
                .replace_status(local_model, &PostParams::default(), status_body(&parent)?)
                .await
            {
                Ok(_) => {
                    assigned = Some(next);
                    break;
                }
                Err(err) if is_conflict(&err) => {
                    debug!(local_model, attempt, "LocalModel changed while assigning version");
                }
                Err(err) => {
                    return Err(err).with_context(|_| KubeSnafu {
                        msg: format!("failed to update LocalModel {ns}/{local_model}"),
                    })
                }
            }
        }
        let Some(version) = assigned else {
            snafu::whatever!(
                "gave up assigning a version from LocalModel {ns}/{local_model} after {} attempts",
                VERSION_ASSIGN_ATTEMPTS
            );
        };

        // Conflicts if the version changed since the re-read, the retry then finds its number
        fresh.status.get_or_insert_with(Default::default).version = version;
        versions
            .replace_status(&name, &PostParams::default(), status_body(&fresh)?)
            .await
            .with_context(|_| KubeSnafu { msg: "failed to record LocalModelVersion version" })?;

        info!(version, "Assigned version");
        Ok(version)
    }

    /// Unpin the LocalModel's default if it's this version. Owned PVC, Job and VolumeSnapshot
    /// are garbage collected.
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let Some(ns) = self.namespace() else { return Ok(Action::await_change()) };
        let local_models: Api<LocalModel> = Api::namespaced(ctx.client.clone(), &ns);
        let parent = local_models.get_opt(&self.spec.local_model).await.with_context(|_| {
            KubeSnafu { msg: format!("failed to get LocalModel {ns}/{}", self.spec.local_model) }
        })?;
        let Some(parent) = parent else { return Ok(Action::await_change()) };

        if parent.spec.default_version == name {
            local_models
                .patch(
                    &parent.name_any(),
                    &PatchParams::apply(OPERATOR),
                    &Patch::Merge(json!({ "spec": { "defaultVersion": "" } })),
                )
                .await
                .with_context(|_| KubeSnafu { msg: "failed to unset default version" })?;

            let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone(), &parent);
            let result = recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "DefaultVersionDeleted".into(),
                    note: Some(format!("Default version {name} deleted, using the latest")),
                    action: "Deleting".into(),
                    secondary: Some(self.object_ref(&())),
                })
                .await;
            // Don't let failure to record the event block the finalizer
            if let Err(err) = result {
                warn!(?err, "Failed to add event to LocalModel");
            }
        }
        Ok(Action::await_change())
    }
}

impl LocalModel {
    #[instrument(skip_all, fields(ns, name = %self.name_any()))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let ns = self.namespace().context(MissingFieldSnafu {
            kind: "LocalModel",
            name: name.clone(),
            field: "metadata.namespace",
        })?;
        tracing::Span::current().record("ns", ns.as_str());
        if self.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let versions: Api<LocalModelVersion> = Api::namespaced(ctx.client.clone(), &ns);
        let default = if self.spec.default_version.is_empty() {
            let list = versions
                .list(&ListParams::default().labels(&format!("{LOCAL_MODEL_NAME_LABEL}={name}")))
                .await
                .with_context(|_| KubeSnafu { msg: "failed to list LocalModelVersions" })?;
            latest_ready_version(&list.items).ok_or("no ready version")
        } else {
            let pinned = versions.get_opt(&self.spec.default_version).await.with_context(|_| {
                KubeSnafu { msg: format!("failed to get default version {ns}/{name}") }
            })?;
            pinned
                .and_then(|x| Some((x.status?.version, x.metadata.name?)))
                .filter(|(version, _)| *version > 0)
                .ok_or("default version not found")
        };

        let generation = self.meta().generation;
        let mut updated = self.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        match default {
            Ok((version, version_name)) => {
                status.default_version = version;
                status.default_version_name = version_name;
                set_ready(&mut status.conditions, true, "DefaultVersionSet", "", generation);
            }
            Err(message) => {
                status.default_version = 0;
                status.default_version_name.clear();
                set_ready(&mut status.conditions, false, "NoDefaultVersion", message, generation);
            }
        }

        let current = self.status.clone().unwrap_or_default();
        let changed = current.default_version != status.default_version
            || current.default_version_name != status.default_version_name
            || is_ready(&current.conditions) != is_ready(&status.conditions);
        if changed {
            info!(version = status.default_version, "Updating default version");
            // Stale writes conflict with version assignment and are retried
            let local_models: Api<LocalModel> = Api::namespaced(ctx.client.clone(), &ns);
            local_models
                .replace_status(&name, &PostParams::default(), status_body(&updated)?)
                .await
                .with_context(|_| KubeSnafu { msg: "failed to update LocalModel status" })?;
        }

        Ok(Action::requeue(Duration::from_secs(60 * 5)))
    }
}

async fn reconcile_local_model(
    local_model: Arc<LocalModel>, ctx: Arc<Context>,
) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("LocalModel");
    ctx.diagnostics.write().await.last_event = chrono::Utc::now();
    local_model.reconcile(ctx.clone()).await
}

async fn reconcile_version(version: Arc<LocalModelVersion>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("LocalModelVersion");
    ctx.diagnostics.write().await.last_event = chrono::Utc::now();
    let Some(ns) = version.namespace() else { return Ok(Action::await_change()) };
    let versions: Api<LocalModelVersion> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&versions, LOCAL_MODEL_VERSION_FINALIZER, version, |event| async {
        match event {
            FinalizerEvent::Apply(version) => version.reconcile(ctx.clone()).await,
            FinalizerEvent::Cleanup(version) => version.cleanup(ctx.clone()).await,
        }
    })
    .await
    .with_context(|_| FinalizerSnafu)
}

/// Keep LocalModel default versions current until a shutdown signal arrives. Any change to a
/// LocalModelVersion re-evaluates its LocalModel.
pub async fn run_local_models(ctx: Arc<Context>) {
    let wc = watcher::Config::default().any_semantic();
    let local_models = Api::<LocalModel>::all(ctx.client.clone());
    let versions = Api::<LocalModelVersion>::all(ctx.client.clone());

    Controller::new(local_models, wc.clone())
        .watches(versions, wc, |version| {
            let ns = version.namespace()?;
            Some(ObjectRef::<LocalModel>::new(&version.spec.local_model).within(&ns))
        })
        .shutdown_on_signal()
        .run(reconcile_local_model, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| future::ready(()))
        .await;
}

/// Reconcile LocalModelVersions until a shutdown signal arrives
pub async fn run_local_model_versions(ctx: Arc<Context>) {
    let versions = Api::<LocalModelVersion>::all(ctx.client.clone());
    Controller::new(versions, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_version, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| future::ready(()))
        .await;
}
