use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "kuberlogic.com",
    version = "v1alpha1",
    kind = "KuberLogicService",
    shortname = "kls"
)]
#[kube(status = "KuberLogicServiceStatus")]
#[kube(
    printcolumn = r#"{"name":"TYPE", "type":"string", "description":"Database type", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"NAMESPACE", "type":"string", "description":"Namespace holding the workload", "jsonPath":".status.namespace"}"#,
    printcolumn = r#"{"name":"BACKUP", "type":"string", "description":"Active backup", "jsonPath":".status.activeBackupName"}"#,
    printcolumn = r#"{"name":"RESTORE", "type":"string", "description":"Active restore", "jsonPath":".status.activeRestoreName"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KuberLogicServiceSpec {
    pub r#type: String,
    pub replicas: Option<i32>,
    pub paused: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KuberLogicServiceStatus {
    pub namespace: Option<String>,
    #[serde(default)]
    pub active_backup_name: String,
    #[serde(default)]
    pub active_restore_name: String,
}

/// The operation holding a workload when another one asks to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    Backup(String),
    Restore(String),
}

impl std::fmt::Display for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Blocker::Backup(name) => write!(f, "backup {name} is running"),
            Blocker::Restore(name) => write!(f, "restore {name} is running"),
        }
    }
}

impl KuberLogicService {
    /// Namespace that holds the workload's pods and volumes.
    pub fn target_namespace(&self) -> String {
        self.status
            .as_ref()
            .and_then(|status| status.namespace.clone())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    pub fn active_backup(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.active_backup_name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn active_restore(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.active_restore_name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn is_paused(&self) -> bool {
        self.spec.paused.unwrap_or(false)
    }

    /// New pods must not be scheduled while this holds.
    pub fn is_gated(&self) -> bool {
        self.active_backup().is_some() || self.active_restore().is_some() || self.is_paused()
    }

    pub fn backup_blocker(&self, backup: &str) -> Option<Blocker> {
        self.status.as_ref().and_then(|s| s.backup_blocker(backup))
    }

    pub fn restore_blocker(&self, restore: &str) -> Option<Blocker> {
        self.status.as_ref().and_then(|s| s.restore_blocker(restore))
    }
}

impl KuberLogicServiceStatus {
    pub fn backup_blocker(&self, backup: &str) -> Option<Blocker> {
        if !self.active_restore_name.is_empty() {
            return Some(Blocker::Restore(self.active_restore_name.clone()));
        }
        if !self.active_backup_name.is_empty() && self.active_backup_name.ne(backup) {
            return Some(Blocker::Backup(self.active_backup_name.clone()));
        }
        None
    }

    pub fn restore_blocker(&self, restore: &str) -> Option<Blocker> {
        if !self.active_backup_name.is_empty() {
            return Some(Blocker::Backup(self.active_backup_name.clone()));
        }
        if !self.active_restore_name.is_empty() && self.active_restore_name.ne(restore) {
            return Some(Blocker::Restore(self.active_restore_name.clone()));
        }
        None
    }

    /// Record `backup` as the active backup. Returns whether the status changed.
    /// Never claims while another operation holds the workload.
    pub fn claim_backup(&mut self, backup: &str) -> Result<bool, Blocker> {
        if let Some(blocker) = self.backup_blocker(backup) {
            return Err(blocker);
        }
        if self.active_backup_name.eq(backup) {
            return Ok(false);
        }
        self.active_backup_name = backup.to_string();
        Ok(true)
    }

    pub fn claim_restore(&mut self, restore: &str) -> Result<bool, Blocker> {
        if let Some(blocker) = self.restore_blocker(restore) {
            return Err(blocker);
        }
        if self.active_restore_name.eq(restore) {
            return Ok(false);
        }
        self.active_restore_name = restore.to_string();
        Ok(true)
    }

    /// Clear the active backup if it is `backup`. Returns whether the status changed.
    pub fn release_backup(&mut self, backup: &str) -> bool {
        if self.active_backup_name.eq(backup) {
            self.active_backup_name.clear();
            return true;
        }
        false
    }

    pub fn release_restore(&mut self, restore: &str) -> bool {
        if self.active_restore_name.eq(restore) {
            self.active_restore_name.clear();
            return true;
        }
        false
    }
}
