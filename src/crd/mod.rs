pub mod dataset;
pub mod local_model;
pub mod model;
pub mod registry;
pub mod snapshotting;
pub mod volume_snapshot;

use chrono::Utc;
pub use dataset::*;
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    List,
};
pub use local_model::*;
pub use model::*;
pub use registry::*;
pub use snapshotting::*;
pub use volume_snapshot::*;

use kube::CustomResourceExt as _;

pub static READY_CONDITION: &str = "Ready";

/// All ml.llmos.ai CRDs as a YAML list, ready for `kubectl apply -f -`.
pub fn generate_crds() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&List {
        items: vec![
            Registry::crd(),
            Model::crd(),
            Dataset::crd(),
            DatasetVersion::crd(),
            LocalModel::crd(),
            LocalModelVersion::crd(),
        ],
        ..Default::default()
    })
}

pub fn is_ready(conditions: &[Condition]) -> bool {
    conditions.iter().any(|x| x.type_ == READY_CONDITION && x.status == "True")
}

/// Set the Ready condition, keeping its transition time when the status doesn't change.
pub fn set_ready(
    conditions: &mut Vec<Condition>, ready: bool, reason: &str, message: impl Into<String>,
    generation: Option<i64>,
) {
    let status = if ready { "True" } else { "False" };
    let message = message.into();
    match conditions.iter_mut().find(|x| x.type_ == READY_CONDITION) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Time(Utc::now());
            }
            existing.status = status.into();
            existing.reason = reason.into();
            existing.message = message;
            existing.observed_generation = generation;
        }
        None => conditions.push(Condition {
            type_: READY_CONDITION.into(),
            status: status.into(),
            reason: reason.into(),
            message,
            observed_generation: generation,
            last_transition_time: Time(Utc::now()),
        }),
    }
}

/// Update the Ready message without touching its status. Adds an `Unknown` Ready condition
/// if there is none yet.
pub fn set_ready_message(
    conditions: &mut Vec<Condition>, reason: &str, message: impl Into<String>,
) {
    match conditions.iter_mut().find(|x| x.type_ == READY_CONDITION) {
        Some(existing) => {
            existing.reason = reason.into();
            existing.message = message.into();
        }
        None => conditions.push(Condition {
            type_: READY_CONDITION.into(),
            status: "Unknown".into(),
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Time(Utc::now()),
        }),
    }
}
