use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::phase::{Phase, Progress};

pub const KUBERLOGIC_SERVICE_BACKUP_FINALIZER: &str =
    "kuberlogicservicebackup.kuberlogic.com/finalizer";

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "kuberlogic.com",
    version = "v1alpha1",
    kind = "KuberlogicServiceBackup",
    shortname = "klb"
)]
#[kube(status = "KuberlogicServiceBackupStatus")]
#[kube(
    printcolumn = r#"{"name":"SERVICE", "type":"string", "description":"Target KuberLogicService", "jsonPath":".spec.kuberlogicServiceName"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Backup phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ATTEMPTS", "type":"integer", "description":"Failed attempts", "jsonPath":".status.failedAttempts"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KuberlogicServiceBackupSpec {
    pub kuberlogic_service_name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KuberlogicServiceBackupStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub failed_attempts: i32,
    pub reason: Option<String>,
    pub last_transition_time: Option<Time>,
    pub backup_reference: Option<String>,
}

impl KuberlogicServiceBackupStatus {
    pub fn set_phase(&mut self, phase: Phase, reason: Option<String>) {
        if self.phase.ne(&phase) {
            self.last_transition_time = Some(Time(Utc::now()));
        }
        self.phase = phase;
        self.reason = reason;
    }

    /// Apply `desired` on top of the stored status without ever lowering the attempt counter.
    pub fn merge(&mut self, desired: &KuberlogicServiceBackupStatus) {
        let failed_attempts = self.failed_attempts.max(desired.failed_attempts);
        *self = desired.clone();
        self.failed_attempts = failed_attempts;
    }
}

impl KuberlogicServiceBackup {
    pub fn status_mut(&mut self) -> &mut KuberlogicServiceBackupStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Progress for KuberlogicServiceBackup {
    fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    fn failed_attempts(&self) -> i32 {
        self.status.as_ref().map(|s| s.failed_attempts).unwrap_or(0)
    }
}
