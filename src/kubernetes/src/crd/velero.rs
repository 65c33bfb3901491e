//! Velero objects driven by the backup provider.
//!
//! Only the fields read or written by klbrd are modelled. Unknown fields are
//! dropped on deserialization, so these types are never used to update Velero
//! owned objects in place.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const VELERO_NAMESPACE: &str = "velero";
pub const DEFAULT_STORAGE_LOCATION: &str = "default";

/// Resources never restored on top of a live cluster.
pub const RESTORE_EXCLUDED_RESOURCES: [&str; 6] = [
    "nodes",
    "events",
    "events.events.k8s.io",
    "backups.velero.io",
    "restores.velero.io",
    "resticrepositories.velero.io",
];

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "velero.io", version = "v1", kind = "Backup", namespaced)]
#[kube(status = "BackupStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_locations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub phase: Option<BackupPhase>,
    pub completion_timestamp: Option<Time>,
    pub progress: Option<BackupProgress>,
    pub failure_reason: Option<String>,
    pub errors: Option<i32>,
    pub warnings: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub total_items: Option<i32>,
    pub items_backed_up: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BackupPhase {
    New,
    FailedValidation,
    InProgress,
    WaitingForPluginOperations,
    WaitingForPluginOperationsPartiallyFailed,
    Finalizing,
    FinalizingPartiallyFailed,
    Completed,
    PartiallyFailed,
    Failed,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl BackupPhase {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BackupPhase::FailedValidation | BackupPhase::PartiallyFailed | BackupPhase::Failed
        )
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Backup {
    pub fn phase(&self) -> Option<BackupPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "BackupStorageLocation",
    namespaced
)]
#[kube(status = "BackupStorageLocationStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    pub provider: Option<String>,
    pub default: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationStatus {
    pub phase: Option<BackupStorageLocationPhase>,
    pub last_validation_time: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BackupStorageLocationPhase {
    Available,
    Unavailable,
    #[serde(other)]
    Unknown,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "velero.io", version = "v1", kind = "Restore", namespaced)]
#[kube(status = "RestoreStatus")]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub backup_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    pub phase: Option<RestorePhase>,
    pub completion_timestamp: Option<Time>,
    pub errors: Option<i32>,
    pub warnings: Option<i32>,
    pub progress: Option<RestoreProgress>,
    pub failure_reason: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreProgress {
    pub total_items: Option<i32>,
    pub items_restored: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum RestorePhase {
    New,
    FailedValidation,
    InProgress,
    WaitingForPluginOperations,
    WaitingForPluginOperationsPartiallyFailed,
    Completed,
    PartiallyFailed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl RestorePhase {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RestorePhase::FailedValidation | RestorePhase::PartiallyFailed | RestorePhase::Failed
        )
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "DeleteBackupRequest",
    namespaced
)]
#[kube(status = "DeleteBackupRequestStatus")]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestSpec {
    pub backup_name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestStatus {
    pub phase: Option<DeleteBackupRequestPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum DeleteBackupRequestPhase {
    New,
    InProgress,
    Processed,
    #[serde(other)]
    Unknown,
}
