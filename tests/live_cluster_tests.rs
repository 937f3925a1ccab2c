//! Runs the operator against the cluster in the current kube context. The ml.llmos.ai CRDs
//! must be installed (`cargo run --bin crdgen | kubectl apply -f -`).

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{DeleteParams, PostParams},
    runtime::wait::await_condition,
    Api, ResourceExt,
};
use llmos_operator::{
    config::AppConfig,
    crd::{
        LocalModel, LocalModelVersion, LOCAL_MODEL_NAME_LABEL, LOCAL_MODEL_VERSION_FINALIZER,
        MODEL_NAMESPACE_LABEL, MODEL_NAME_LABEL, REGISTRY_NAME_LABEL,
    },
    State,
};
use serde_json::json;
use test_context::{test_context, AsyncTestContext};
use tokio::task::JoinHandle;

struct ClusterContext {
    client: kube::Client,
    operator: Option<JoinHandle<()>>,
    namespace: Option<Namespace>,
}

impl ClusterContext {
    fn start_operator(&mut self, settings: AppConfig) {
        let state = State::new(settings);
        self.operator = Some(tokio::spawn(async move {
            if let Err(err) = llmos_operator::run(state).await {
                eprintln!("operator stopped: {err}");
            }
        }));
    }

    async fn create_test_ns(&mut self) -> String {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = namespaces
            .create(
                &PostParams::default(),
                &serde_json::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": { "generateName": "llmos-operator-test-" },
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        let name = ns.name_any();
        self.namespace = Some(ns);
        name
    }

    async fn create_version(&self, ns: &str, name: &str) {
        let versions: Api<LocalModelVersion> = Api::namespaced(self.client.clone(), ns);
        let version = serde_json::from_value(json!({
            "apiVersion": "ml.llmos.ai/v1",
            "kind": "LocalModelVersion",
            "metadata": {
                "name": name,
                "labels": {
                    LOCAL_MODEL_NAME_LABEL: "qwen",
                    REGISTRY_NAME_LABEL: "missing-registry",
                    MODEL_NAMESPACE_LABEL: "qwen",
                    MODEL_NAME_LABEL: "qwen2.5-0.5b",
                },
            },
            "spec": { "localModel": "qwen" },
        }))
        .unwrap();
        versions.create(&PostParams::default(), &version).await.unwrap();
    }
}

#[async_trait::async_trait]
impl AsyncTestContext for ClusterContext {
    async fn setup() -> Self {
        llmos_operator::telemetry::init();

        ClusterContext {
            client: kube::Client::try_default().await.unwrap(),
            operator: None,
            namespace: None,
        }
    }

    async fn teardown(self) {
        if let Some(operator) = self.operator {
            operator.abort();
        }
        if let Some(ns) = self.namespace {
            let namespaces: Api<Namespace> = Api::all(self.client.clone());
            let _ = namespaces.delete(&ns.name_any(), &DeleteParams::default()).await;
        }
    }
}

#[test_context(ClusterContext)]
#[tokio::test]
#[ignore = "needs a cluster with the ml.llmos.ai CRDs installed"]
async fn test_concurrent_versions_get_distinct_numbers(ctx: &mut ClusterContext) {
    let ns = ctx.create_test_ns().await;
    ctx.start_operator(AppConfig::default());

    let local_models: Api<LocalModel> = Api::namespaced(ctx.client.clone(), &ns);
    let local_model = serde_json::from_value(json!({
        "apiVersion": "ml.llmos.ai/v1",
        "kind": "LocalModel",
        "metadata": { "name": "qwen" },
        "spec": { "registry": "missing-registry", "modelName": "qwen/qwen2.5-0.5b" },
    }))
    .unwrap();
    local_models.create(&PostParams::default(), &local_model).await.unwrap();

    tokio::join!(ctx.create_version(&ns, "qwen-a"), ctx.create_version(&ns, "qwen-b"));

    let versions: Api<LocalModelVersion> = Api::namespaced(ctx.client.clone(), &ns);
    let mut numbers = Vec::new();
    for name in ["qwen-a", "qwen-b"] {
        let assigned = |x: Option<&LocalModelVersion>| {
            x.and_then(|x| x.status.as_ref()).is_some_and(|x| x.version > 0)
        };
        let version = tokio::time::timeout(
            Duration::from_secs(30),
            await_condition(versions.clone(), name, assigned),
        )
        .await
        .expect("version is assigned in time")
        .unwrap()
        .unwrap();

        assert!(version.finalizers().iter().any(|x| x == LOCAL_MODEL_VERSION_FINALIZER));
        numbers.push(version.status.unwrap().version);
    }
    numbers.sort();
    assert_eq!(numbers, vec![1, 2]);

    let parent = local_models.get("qwen").await.unwrap();
    assert_eq!(parent.status.unwrap().latest_version, 2);

    // The finalizer lets go once cleanup ran
    versions.delete("qwen-a", &DeleteParams::default()).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(30),
        await_condition(versions.clone(), "qwen-a", |x: Option<&LocalModelVersion>| x.is_none()),
    )
    .await
    .expect("version is deleted in time")
    .unwrap();
}
