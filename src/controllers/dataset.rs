use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future, StreamExt as _};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    runtime::{controller::Action, watcher, Controller},
    Api, Client, Resource as _, ResourceExt as _,
};
use maplit::btreemap;
use serde_json::json;
use snafu::{OptionExt as _, ResultExt as _};
use tracing::{debug, info, instrument};

use super::{error_policy, owner_references, status_body};
use crate::{
    config::AppConfig,
    crd::{
        is_ready, set_ready, Dataset, DatasetVersion, SnapshottingPhase, SnapshottingStatus,
        VersionRef, DATASET_NAME_LABEL, DATASET_VERSION_LABEL, DATASET_VERSION_RESOURCE,
        READY_CONDITION,
    },
    registry::RegistryManager,
    snapshotting::{JobSpec, PvcSpec, ResourceHandler, Spec},
    Context, KubeSnafu, MissingFieldSnafu, Result, OPERATOR,
};

static DATASET_DIR: &str = "/data/datasets";

/// Snapshotting hooks of DatasetVersion. Progress lives in `status.publishStatus`.
pub struct DatasetVersionHandler {
    client: Client,
    registries: RegistryManager,
}

impl DatasetVersionHandler {
    pub fn new(client: Client, registries: RegistryManager) -> Self {
        Self { client, registries }
    }

    fn api(&self, namespace: &str) -> Api<DatasetVersion> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<DatasetVersion> {
        self.api(namespace).get(name).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get DatasetVersion {namespace}/{name}"),
        })
    }
}

#[async_trait]
impl ResourceHandler for DatasetVersionHandler {
    async fn get_snapshotting_status(
        &self, namespace: &str, name: &str,
    ) -> Result<SnapshottingStatus> {
        let version = self.get(namespace, name).await?;
        Ok(version.status.map(|x| x.publish_status).unwrap_or_default())
    }

    async fn update_snapshotting_status(
        &self, namespace: &str, name: &str, status: Option<&SnapshottingStatus>,
    ) -> Result<()> {
        let mut version = self.get(namespace, name).await?;
        version.status.get_or_insert_with(Default::default).publish_status =
            status.cloned().unwrap_or_default();

        self.api(namespace)
            .replace_status(name, &PostParams::default(), status_body(&version)?)
            .await
            .with_context(|_| KubeSnafu {
                msg: format!("failed to update publish status of {namespace}/{name}"),
            })?;
        Ok(())
    }

    async fn get_content_size(&self, namespace: &str, name: &str) -> Result<i64> {
        let version = self.get(namespace, name).await?;
        let status = version.status.unwrap_or_default();
        snafu::ensure!(
            !status.registry.is_empty(),
            MissingFieldSnafu { kind: "DatasetVersion", name, field: "status.registry" }
        );

        let backend = self.registries.backend_from_registry(&status.registry).await?;
        backend.get_size(&status.root_path).await
    }

    async fn get_latest_ready_snapshot(
        &self, namespace: &str, owner: &str,
    ) -> Result<Option<String>> {
        let versions = self
            .api(namespace)
            .list(&ListParams::default().labels(&format!("{DATASET_NAME_LABEL}={owner}")))
            .await
            .with_context(|_| KubeSnafu {
                msg: format!("failed to list versions of Dataset {namespace}/{owner}"),
            })?;
        Ok(latest_published(&versions.items))
    }

    fn resource_type(&self) -> &str {
        DATASET_VERSION_RESOURCE
    }
}

/// Snapshot of the highest numbered version whose publish run completed.
fn latest_published(versions: &[DatasetVersion]) -> Option<String> {
    versions
        .iter()
        .filter_map(|x| {
            let status = &x.status.as_ref()?.publish_status;
            let published = status.current_phase() == SnapshottingPhase::SnapshotReady
                && !status.snapshot_name.is_empty();
            if !published {
                return None;
            }
            Some((x.spec.version_number()?, status.snapshot_name.clone()))
        })
        .max_by_key(|(number, _)| *number)
        .map(|(_, snapshot)| snapshot)
}

/// Snapshotting spec of one DatasetVersion. Publish runs always download the whole version.
fn publish_spec(version: &DatasetVersion, namespace: &str, config: &AppConfig) -> Spec {
    let name = version.name_any();
    let dataset = &version.spec.dataset;
    let root_path = version.status.as_ref().map(|x| x.root_path.as_str()).unwrap_or_default();

    Spec {
        namespace: namespace.to_string(),
        name: name.clone(),
        labels: btreemap! {
            DATASET_NAME_LABEL.to_string() => dataset.clone(),
            DATASET_VERSION_LABEL.to_string() => version.spec.version.clone(),
        },
        owner_references: owner_references(version),
        pvc_spec: PvcSpec {
            access_modes: vec!["ReadWriteOnce".into()],
            owner_label: Some(DATASET_NAME_LABEL.to_string()),
            ..Default::default()
        },
        job_spec: JobSpec {
            backoff_limit: Some(1),
            ttl_seconds_after_finished: None,
            image: config.dataset_downloader_image.clone(),
            args: vec![
                format!("--name={namespace}/{dataset}"),
                format!("--version={}", version.spec.version),
                format!("--path={root_path}"),
                format!(
                    "--output-dir={DATASET_DIR}/{namespace}/{dataset}/{}",
                    version.spec.version
                ),
            ],
        },
    }
}

impl DatasetVersion {
    #[instrument(skip_all, fields(ns, name = %self.name_any()))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let ns = self.namespace().context(MissingFieldSnafu {
            kind: "DatasetVersion",
            name: name.clone(),
            field: "metadata.namespace",
        })?;
        tracing::Span::current().record("ns", ns.as_str());

        if self.meta().deletion_timestamp.is_some() {
            // Owned PVC, Job and VolumeSnapshot are garbage collected
            return Ok(Action::await_change());
        }

        let versions: Api<DatasetVersion> = Api::namespaced(ctx.client.clone(), &ns);
        let datasets: Api<Dataset> = Api::namespaced(ctx.client.clone(), &ns);
        let dataset = datasets.get_opt(&self.spec.dataset).await.with_context(|_| KubeSnafu {
            msg: format!("failed to get Dataset {ns}/{}", self.spec.dataset),
        })?;
        let Some(dataset) = dataset.filter(|x| {
            x.status.as_ref().is_some_and(|status| is_ready(&status.conditions))
        }) else {
            debug!(dataset = self.spec.dataset, "Dataset is not ready yet");
            self.update_ready(&versions, false, "DatasetNotReady", "dataset is not ready").await?;
            return Ok(Action::requeue(Duration::from_secs(10)));
        };
        let dataset_status = dataset.status.clone().unwrap_or_default();

        // Resolve where the version's files live
        let status = self.status.clone().unwrap_or_default();
        let root_path =
            format!("{}/{}", dataset_status.root_path.trim_end_matches('/'), self.spec.version);
        if status.registry != dataset.spec.registry || status.root_path != root_path {
            versions
                .patch_status(
                    &name,
                    &PatchParams::apply(OPERATOR),
                    &Patch::Merge(json!({
                        "status": { "registry": dataset.spec.registry, "rootPath": root_path },
                    })),
                )
                .await
                .with_context(|_| KubeSnafu { msg: "failed to update DatasetVersion status" })?;
            return Ok(Action::requeue(Duration::ZERO));
        }

        let backend = ctx.registries.backend_from_registry(&status.registry).await?;
        if !backend.directory_exists(&root_path).await? {
            let message = format!("directory {root_path} does not exist in registry");
            self.update_ready(&versions, false, "DirectoryMissing", message).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        if !is_ready(&status.conditions) {
            self.update_ready(&versions, true, "Available", "").await?;
        }
        self.add_to_dataset(&datasets, dataset).await?;

        let spec = publish_spec(self, &ns, &ctx.config);
        if self.spec.publish {
            ctx.dataset_snapshots.do_snapshot(&spec).await?;
        } else if !status.publish_status.is_empty() {
            info!("Publishing turned off, removing snapshot");
            ctx.dataset_snapshots.cancel_snapshot(&spec).await?;
        }

        Ok(Action::requeue(Duration::from_secs(60 * 5)))
    }

    async fn update_ready(
        &self, versions: &Api<DatasetVersion>, ready: bool, reason: &str,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        let current = self.status.as_ref().and_then(|x| {
            x.conditions.iter().find(|c| c.type_ == READY_CONDITION)
        });
        if current.is_some_and(|c| (c.status == "True") == ready && c.message == message) {
            return Ok(());
        }

        let name = self.name_any();
        let mut fresh = versions
            .get(&name)
            .await
            .with_context(|_| KubeSnafu { msg: "failed to get DatasetVersion" })?;
        let status = fresh.status.get_or_insert_with(Default::default);
        set_ready(&mut status.conditions, ready, reason, message, self.meta().generation);

        versions
            .replace_status(&name, &PostParams::default(), status_body(&fresh)?)
            .await
            .with_context(|_| KubeSnafu { msg: "failed to set DatasetVersion Ready condition" })?;
        Ok(())
    }

    /// List this version on its Dataset
    async fn add_to_dataset(&self, datasets: &Api<Dataset>, mut dataset: Dataset) -> Result<()> {
        let entry = VersionRef { version: self.spec.version.clone(), object_name: self.name_any() };
        let status = dataset.status.get_or_insert_with(Default::default);
        if status.versions.contains(&entry) {
            return Ok(());
        }
        status.versions.push(entry);

        datasets
            .replace_status(&dataset.name_any(), &PostParams::default(), status_body(&dataset)?)
            .await
            .with_context(|_| KubeSnafu { msg: "failed to add version to Dataset status" })?;
        Ok(())
    }
}

async fn reconcile(version: Arc<DatasetVersion>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("DatasetVersion");
    ctx.diagnostics.write().await.last_event = chrono::Utc::now();
    version.reconcile(ctx.clone()).await
}

/// Reconcile DatasetVersions until a shutdown signal arrives
pub async fn run(ctx: Arc<Context>) {
    let versions = Api::<DatasetVersion>::all(ctx.client.clone());
    Controller::new(versions, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| future::ready(()))
        .await;
}
