//! Reconcilers of the ml.llmos.ai kinds that own a snapshotting workflow.

pub mod dataset;
pub mod local_model;

use std::{fmt::Debug, sync::Arc, time::Duration};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{runtime::controller::Action, Resource, ResourceExt as _};
use serde::Serialize;
use snafu::ResultExt as _;
use tracing::warn;

use crate::{AppError, Context, Result, SerializationSnafu};

pub(crate) fn error_policy<K>(obj: Arc<K>, error: &AppError, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    warn!(name = %obj.name_any(), "reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&K::kind(&()), error);
    Action::requeue(Duration::from_secs(30))
}

/// Makes `obj` the controller of everything created on its behalf.
pub(crate) fn owner_references<K: Resource<DynamicType = ()>>(obj: &K) -> Vec<OwnerReference> {
    obj.controller_owner_ref(&()).into_iter().collect()
}

/// Body for `replace_status`. Carries the object's resourceVersion, so a stale write is
/// rejected with a conflict.
pub(crate) fn status_body<K: Serialize + Debug>(obj: &K) -> Result<Vec<u8>> {
    serde_json::to_vec(obj).context(SerializationSnafu)
}
