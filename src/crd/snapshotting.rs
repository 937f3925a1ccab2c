use std::fmt::Display;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Progress of the PVC -> download Job -> VolumeSnapshot workflow.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SnapshottingPhase {
    #[default]
    PreparePvc,
    PvcReady,
    Downloading,
    Downloaded,
    Snapshotting,
    SnapshotReady,
    Failed,
    /// A value this operator doesn't know how to act on, kept verbatim.
    Unknown(String),
}

impl SnapshottingPhase {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreparePvc => "PreparePVC",
            Self::PvcReady => "PVCReady",
            Self::Downloading => "Downloading",
            Self::Downloaded => "Downloaded",
            Self::Snapshotting => "Snapshotting",
            Self::SnapshotReady => "SnapshotReady",
            Self::Failed => "Failed",
            Self::Unknown(x) => x,
        }
    }
}

impl From<&str> for SnapshottingPhase {
    fn from(value: &str) -> Self {
        match value {
            "" | "PreparePVC" => Self::PreparePvc,
            "PVCReady" => Self::PvcReady,
            "Downloading" => Self::Downloading,
            "Downloaded" => Self::Downloaded,
            "Snapshotting" => Self::Snapshotting,
            "SnapshotReady" => Self::SnapshotReady,
            "Failed" => Self::Failed,
            x => Self::Unknown(x.to_string()),
        }
    }
}

impl Display for SnapshottingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for SnapshottingPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SnapshottingPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value.as_str()))
    }
}

/// Snapshotting progress, embedded in the status of the resource that owns the workflow.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshottingStatus {
    /// Unset until the workflow runs for the first time, and again after it's cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub phase: Option<SnapshottingPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Name of the VolumeSnapshot created for this run.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_name: String,

    /// Name of the PVC the download Job writes into.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pvc_name: String,

    /// Name of the Job downloading the content.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_name: String,
}

impl SnapshottingStatus {
    pub fn new(phase: SnapshottingPhase, message: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            last_transition_time: Some(Utc::now()),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_pvc(mut self, name: &str) -> Self {
        self.pvc_name = name.to_string();
        self
    }

    pub fn with_job(mut self, name: &str) -> Self {
        self.job_name = name.to_string();
        self
    }

    pub fn with_snapshot(mut self, name: &str) -> Self {
        self.snapshot_name = name.to_string();
        self
    }

    /// Phase the workflow is in, an unset phase means it hasn't started.
    pub fn current_phase(&self) -> SnapshottingPhase {
        self.phase.clone().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
    }
}
