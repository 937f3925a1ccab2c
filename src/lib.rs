use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::{
    api::ListParams,
    runtime::events::{Recorder, Reporter},
    Api, Client, Resource,
};
use serde::Serialize;
use snafu::ResultExt as _;
use tokio::sync::RwLock;
use tracing::{error, info};

pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod snapshotting;
pub mod telemetry;

pub use error::*;

use crate::{
    config::AppConfig,
    controllers::{dataset::DatasetVersionHandler, local_model::LocalModelVersionHandler},
    crd::{DatasetVersion, LocalModelVersion},
    metrics::Metrics,
    registry::RegistryManager,
    snapshotting::Manager,
};

pub static OPERATOR: &str = "llmos-operator";

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Application configuration
    config: AppConfig,
}

impl State {
    pub fn new(config: AppConfig) -> Self {
        Self { config, ..Default::default() }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Controller context. Starts the snapshotting watchers of both owning kinds.
    pub fn to_context(&self, client: Client) -> Result<Arc<Context>> {
        let metrics = Metrics::default()
            .register(&self.registry)
            .whatever_context::<_, AppError>("failed to register metrics")?;
        let registries =
            RegistryManager::new(client.clone(), &self.config.registry_secret_namespace);

        let dataset_snapshots = Manager::register(
            client.clone(),
            Arc::new(DatasetVersionHandler::new(client.clone(), registries.clone())),
            self.config.snapshotting.clone(),
        );
        let local_model_snapshots = Manager::register(
            client.clone(),
            Arc::new(LocalModelVersionHandler::new(client.clone(), registries.clone())),
            self.config.snapshotting.clone(),
        );

        Ok(Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics,
            config: self.config.clone(),
            registries,
            dataset_snapshots,
            local_model_snapshots,
        }))
    }
}

// Context for the reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Application configuration
    pub config: AppConfig,
    pub registries: RegistryManager,
    /// Publishes DatasetVersions into VolumeSnapshots
    pub dataset_snapshots: Manager,
    /// Caches LocalModelVersions into VolumeSnapshots
    pub local_model_snapshots: Manager,
}

// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self { last_event: Utc::now(), reporter: format!("{OPERATOR}-controller").into() }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client, obj: &impl Resource<DynamicType = ()>) -> Recorder {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}

/// Run every controller until a shutdown signal arrives (given the CRDs are installed)
pub async fn run(state: State) -> Result<()> {
    let client =
        Client::try_default().await.context(KubeSnafu { msg: "failed to create kube Client" })?;

    let probe = ListParams::default().limit(1);
    let queryable = match Api::<DatasetVersion>::all(client.clone()).list(&probe).await {
        Ok(_) => Api::<LocalModelVersion>::all(client.clone()).list(&probe).await.map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = queryable {
        error!("CRD is not queryable; {e:?}. Are the CRDs installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        snafu::whatever!("ml.llmos.ai CRDs are not installed");
    }

    let ctx = state.to_context(client)?;
    futures::join!(
        controllers::dataset::run(ctx.clone()),
        controllers::local_model::run_local_models(ctx.clone()),
        controllers::local_model::run_local_model_versions(ctx),
    );
    Ok(())
}
