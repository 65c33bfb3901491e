use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "kuberlogic.com",
    version = "v1alpha1",
    kind = "KuberlogicServiceBackupSchedule",
    shortname = "klbs"
)]
#[kube(namespaced)]
#[kube(
    printcolumn = r#"{"name":"SERVICE", "type":"string", "description":"Target KuberLogicService", "jsonPath":".spec.kuberlogicServiceName"}"#,
    printcolumn = r#"{"name":"SCHEDULE", "type":"string", "description":"Cron schedule", "jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KuberlogicServiceBackupScheduleSpec {
    pub kuberlogic_service_name: String,
    /// Cron formatted schedule
    pub schedule: String,
}
