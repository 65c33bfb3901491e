use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::phase::{Phase, Progress};

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "kuberlogic.com",
    version = "v1alpha1",
    kind = "KuberlogicServiceRestore",
    shortname = "klr"
)]
#[kube(status = "KuberlogicServiceRestoreStatus")]
#[kube(
    printcolumn = r#"{"name":"BACKUP", "type":"string", "description":"Source KuberlogicServiceBackup", "jsonPath":".spec.kuberlogicServiceBackup"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "description":"Restore phase", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ATTEMPTS", "type":"integer", "description":"Failed attempts", "jsonPath":".status.failedAttempts"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KuberlogicServiceRestoreSpec {
    pub kuberlogic_service_backup: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KuberlogicServiceRestoreStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub failed_attempts: i32,
    pub reason: Option<String>,
    pub last_transition_time: Option<Time>,
    pub restore_reference: Option<String>,
}

impl KuberlogicServiceRestoreStatus {
    pub fn set_phase(&mut self, phase: Phase, reason: Option<String>) {
        if self.phase.ne(&phase) {
            self.last_transition_time = Some(Time(Utc::now()));
        }
        self.phase = phase;
        self.reason = reason;
    }

    pub fn merge(&mut self, desired: &KuberlogicServiceRestoreStatus) {
        let failed_attempts = self.failed_attempts.max(desired.failed_attempts);
        *self = desired.clone();
        self.failed_attempts = failed_attempts;
    }
}

impl KuberlogicServiceRestore {
    pub fn status_mut(&mut self) -> &mut KuberlogicServiceRestoreStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Progress for KuberlogicServiceRestore {
    fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    fn failed_attempts(&self) -> i32 {
        self.status.as_ref().map(|s| s.failed_attempts).unwrap_or(0)
    }
}
