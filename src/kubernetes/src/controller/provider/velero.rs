use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, Namespace, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    Volume, VolumeMount,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::ObjectMeta,
    Api, Client, ResourceExt,
};

use crate::{
    controller::{config::BackupConfig, error::Error},
    crd::{
        backup::{KuberlogicServiceBackup, KUBERLOGIC_SERVICE_BACKUP_FINALIZER},
        phase::Phase,
        restore::KuberlogicServiceRestore,
        service::KuberLogicService,
        velero::{
            Backup, BackupPhase, BackupSpec, BackupStorageLocation, BackupStorageLocationPhase,
            DeleteBackupRequest, DeleteBackupRequestPhase, DeleteBackupRequestSpec, Restore,
            RestorePhase, RestoreSpec, RESTORE_EXCLUDED_RESOURCES,
        },
    },
    util::{
        create_owner_reference, get_namespaced_name, is_already_exists, is_controlled_by,
        is_not_found, remove_finalizer,
    },
};

use super::BackupProvider;

pub const BACKUP_POD_NAME: &str = "kl-backup-pod";
pub const BACKUP_POD_CONTAINER: &str = "backup-idle";
pub const BACKUP_POD_IMAGE: &str = "alpine";
pub const BACKUP_POD_SLEEP_SECONDS: &str = "3600";
pub const BACKUP_VOLUMES_ANNOTATION: &str = "backup.velero.io/backup-volumes";

const POD_PHASE_PENDING: &str = "Pending";
const POD_PHASE_RUNNING: &str = "Running";
const POD_PHASE_SUCCEEDED: &str = "Succeeded";
const POD_PHASE_FAILED: &str = "Failed";

/// [`BackupProvider`] backed by Velero.
///
/// Without volume snapshots Velero copies volumes through its file system
/// backup, which needs a running pod mounting every claim. The provider
/// stops the workload's own pods and starts a helper pod instead, so the
/// copied data is consistent.
pub struct Velero {
    client: Client,
    config: BackupConfig,
}

impl Velero {
    pub fn new(client: Client, config: BackupConfig) -> Self {
        Self { client, config }
    }

    fn backups(&self) -> Api<Backup> {
        Api::namespaced(self.client.clone(), &self.config.velero_namespace)
    }

    fn restores(&self) -> Api<Restore> {
        Api::namespaced(self.client.clone(), &self.config.velero_namespace)
    }

    fn storage_locations(&self) -> Api<BackupStorageLocation> {
        Api::namespaced(self.client.clone(), &self.config.velero_namespace)
    }

    fn delete_backup_requests(&self) -> Api<DeleteBackupRequest> {
        Api::namespaced(self.client.clone(), &self.config.velero_namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn sleep(&self) {
        tokio::time::sleep(self.config.poll_interval()).await
    }

    #[tracing::instrument(skip(self))]
    async fn ensure_storage_location(&self, name: &str) -> Result<(), Error> {
        let location = self
            .storage_locations()
            .get_opt(name)
            .await
            .map_err(Error::Kube)?;
        match location {
            Some(location)
                if storage_location_available(
                    &location,
                    Utc::now(),
                    self.config.storage_location_ttl(),
                ) =>
            {
                Ok(())
            }
            Some(_) => {
                tracing::warn!(
                    name,
                    "backup storage location is unavailable or was not validated recently"
                );
                Err(Error::StorageUnavailable(name.to_string()))
            }
            None => {
                tracing::warn!(name, "backup storage location is not found");
                Err(Error::StorageUnavailable(name.to_string()))
            }
        }
    }

    /// Force delete every running pod of `namespace` until none is left.
    #[tracing::instrument(skip(self))]
    async fn pause_pods(&self, namespace: &str) -> Result<(), Error> {
        let pods = self.pods(namespace);
        let force = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        for attempt in 0..self.config.poll_attempts {
            let list = pods
                .list(&ListParams::default())
                .await
                .map_err(Error::Kube)?;
            let running = running_pods(&list.items);
            if running.is_empty() {
                tracing::info!(namespace, "pods are paused");
                return Ok(());
            }
            tracing::info!(namespace, attempt, pods=?running, "force deleting running pods");
            for name in running.iter() {
                match pods.delete(name, &force).await {
                    Ok(_) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(Error::Kube(e)),
                }
            }
            self.sleep().await;
        }
        Err(Error::PodsNotPaused(namespace.to_string()))
    }

    #[tracing::instrument(skip_all)]
    async fn create_backup_pod(
        &self,
        namespace: &str,
        backup: &KuberlogicServiceBackup,
    ) -> Result<(), Error> {
        let claims = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .map_err(Error::Kube)?
            .items
            .iter()
            .map(|pvc| pvc.name_any())
            .collect::<Vec<String>>();

        let pod = backup_pod(namespace, &claims, backup);
        tracing::info!(namespace, claims=?claims, "create backup pod");
        match self.pods(namespace).create(&PostParams::default(), &pod).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn wait_backup_pod_running(&self, namespace: &str) -> Result<(), Error> {
        let pods = self.pods(namespace);
        for _ in 0..self.config.poll_attempts {
            if let Some(pod) = pods.get_opt(BACKUP_POD_NAME).await.map_err(Error::Kube)? {
                if pod_phase(&pod).eq(POD_PHASE_RUNNING) {
                    tracing::info!(namespace, "backup pod is running");
                    return Ok(());
                }
            }
            self.sleep().await;
        }
        Err(Error::BackupPodNotReady(namespace.to_string()))
    }

    /// Delete every pod of `namespace` once the backup pod is observed there.
    #[tracing::instrument(skip(self))]
    async fn delete_paused_pods(&self, namespace: &str) -> Result<(), Error> {
        let pods = self.pods(namespace);
        if pods
            .get_opt(BACKUP_POD_NAME)
            .await
            .map_err(Error::Kube)?
            .is_none()
        {
            tracing::debug!(namespace, "backup pod is already gone");
            return Ok(());
        }
        tracing::info!(namespace, "delete backup pod and paused pods");
        pods.delete_collection(&DeleteParams::default(), &ListParams::default())
            .await
            .map_err(Error::Kube)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_namespace(&self, namespace: &str) -> Result<(), Error> {
        let namespaces = Api::<Namespace>::all(self.client.clone());
        match namespaces.delete(namespace, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(Error::Kube(e)),
        }
        for _ in 0..self.config.poll_attempts {
            if namespaces
                .get_opt(namespace)
                .await
                .map_err(Error::Kube)?
                .is_none()
            {
                tracing::info!(namespace, "namespace is deleted");
                return Ok(());
            }
            self.sleep().await;
        }
        Err(Error::NamespaceNotDeleted(namespace.to_string()))
    }

    fn velero_backup(&self, namespace: &str, backup: &KuberlogicServiceBackup) -> Backup {
        Backup {
            metadata: ObjectMeta {
                name: Some(backup.name_any()),
                namespace: Some(self.config.velero_namespace.clone()),
                owner_references: Some(vec![create_owner_reference(backup)]),
                ..Default::default()
            },
            spec: BackupSpec {
                included_namespaces: vec![namespace.to_string()],
                storage_location: Some(self.config.storage_location.clone()),
                volume_snapshot_locations: vec![self.config.storage_location.clone()],
                snapshot_volumes: Some(self.config.snapshots_enabled),
            },
            status: None,
        }
    }

    fn velero_restore(&self, backup_name: &str, restore: &KuberlogicServiceRestore) -> Restore {
        Restore {
            metadata: ObjectMeta {
                name: Some(restore.name_any()),
                namespace: Some(self.config.velero_namespace.clone()),
                owner_references: Some(vec![create_owner_reference(restore)]),
                ..Default::default()
            },
            spec: RestoreSpec {
                backup_name: backup_name.to_string(),
                excluded_resources: RESTORE_EXCLUDED_RESOURCES
                    .iter()
                    .map(|r| r.to_string())
                    .collect(),
                included_namespaces: vec!["*".to_string()],
            },
            status: None,
        }
    }

    fn delete_backup_request(
        &self,
        backup_name: &str,
        backup: &KuberlogicServiceBackup,
    ) -> DeleteBackupRequest {
        DeleteBackupRequest {
            metadata: ObjectMeta {
                name: Some(backup.name_any()),
                namespace: Some(self.config.velero_namespace.clone()),
                finalizers: Some(vec![KUBERLOGIC_SERVICE_BACKUP_FINALIZER.to_string()]),
                owner_references: Some(vec![create_owner_reference(backup)]),
                ..Default::default()
            },
            spec: DeleteBackupRequestSpec {
                backup_name: backup_name.to_string(),
            },
            status: None,
        }
    }

    async fn own_restore(
        &self,
        backup: &KuberlogicServiceBackup,
        restore: &mut KuberlogicServiceRestore,
    ) -> Result<(), Error> {
        if is_controlled_by(restore, backup) {
            return Ok(());
        }
        let owner = create_owner_reference(backup);
        let patch = serde_json::json!({
            "metadata": {
                "ownerReferences": [owner],
            }
        });
        Api::<KuberlogicServiceRestore>::all(self.client.clone())
            .patch(
                &restore.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(Error::Kube)?;
        restore.metadata.owner_references = Some(vec![owner]);
        Ok(())
    }
}

#[async_trait]
impl BackupProvider for Velero {
    #[tracing::instrument(skip_all, fields(backup = backup.name_any()))]
    async fn backup_request(
        &self,
        workload: &KuberLogicService,
        backup: &mut KuberlogicServiceBackup,
    ) -> Result<(), Error> {
        let name = backup.name_any();
        if self
            .backups()
            .get_opt(&name)
            .await
            .map_err(Error::Kube)?
            .is_some()
        {
            tracing::info!(name, "velero backup already exists");
            backup.status_mut().backup_reference = Some(name);
            return Ok(());
        }

        self.ensure_storage_location(&self.config.storage_location)
            .await?;

        let namespace = workload.target_namespace();
        if !self.config.snapshots_enabled {
            self.pause_pods(&namespace).await?;
            self.create_backup_pod(&namespace, backup).await?;
            self.wait_backup_pod_running(&namespace).await?;
        }

        let velero_backup = self.velero_backup(&namespace, backup);
        match self
            .backups()
            .create(&PostParams::default(), &velero_backup)
            .await
        {
            Ok(_) => tracing::info!(name, namespace, "created velero backup"),
            Err(e) if is_already_exists(&e) => {}
            Err(e) => return Err(Error::Kube(e)),
        }
        backup.status_mut().backup_reference = Some(name);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(backup = backup.name_any()))]
    async fn after_backup(
        &self,
        workload: &KuberLogicService,
        backup: &KuberlogicServiceBackup,
    ) -> Result<(), Error> {
        if self.config.snapshots_enabled {
            return Ok(());
        }
        self.delete_paused_pods(&workload.target_namespace()).await
    }

    #[tracing::instrument(skip_all, fields(backup = backup.name_any()))]
    async fn set_kuberlogic_backup_status(
        &self,
        backup: &mut KuberlogicServiceBackup,
    ) -> Result<(), Error> {
        let reference = backup_reference(backup);
        let velero_backup = self
            .backups()
            .get_opt(&reference)
            .await
            .map_err(Error::Kube)?;
        let (phase, reason) = backup_phase(velero_backup.as_ref());
        backup.status_mut().set_phase(phase, reason);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(backup = backup.name_any()))]
    async fn backup_delete_request(&self, backup: &KuberlogicServiceBackup) -> Result<(), Error> {
        let requests = self.delete_backup_requests();

        if let Some(request) = requests
            .get_opt(&backup.name_any())
            .await
            .map_err(Error::Kube)?
        {
            if !delete_request_fulfilled(&request) {
                tracing::info!(
                    request = get_namespaced_name(&request),
                    "delete backup request has not been fulfilled yet"
                );
                return Err(Error::DeletionPending(backup.name_any()));
            }
            tracing::info!(
                request = get_namespaced_name(&request),
                "delete backup request has been fulfilled"
            );
            return match remove_finalizer(&requests, &request, KUBERLOGIC_SERVICE_BACKUP_FINALIZER)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(Error::Kube(e)),
            };
        }

        let reference = backup_reference(backup);
        if self
            .backups()
            .get_opt(&reference)
            .await
            .map_err(Error::Kube)?
            .is_none()
        {
            tracing::info!(reference, "velero backup does not exist");
            return Ok(());
        }

        let request = self.delete_backup_request(&reference, backup);
        match requests.create(&PostParams::default(), &request).await {
            Ok(_) => tracing::info!(reference, "created delete backup request"),
            Err(e) if is_already_exists(&e) => {}
            Err(e) => return Err(Error::Kube(e)),
        }
        Err(Error::DeletionPending(backup.name_any()))
    }

    #[tracing::instrument(skip_all, fields(restore = restore.name_any()))]
    async fn restore_request(
        &self,
        workload: &KuberLogicService,
        backup: &KuberlogicServiceBackup,
        restore: &mut KuberlogicServiceRestore,
    ) -> Result<(), Error> {
        let name = restore.name_any();
        if self
            .restores()
            .get_opt(&name)
            .await
            .map_err(Error::Kube)?
            .is_some()
        {
            tracing::info!(name, "velero restore already exists");
            restore.status_mut().restore_reference = Some(name);
            return Ok(());
        }

        let reference = backup_reference(backup);
        let velero_backup = match self
            .backups()
            .get_opt(&reference)
            .await
            .map_err(Error::Kube)?
        {
            Some(b) if b.phase().eq(&Some(BackupPhase::Completed)) => b,
            _ => return Err(Error::BackupNotSuccessful(reference)),
        };

        let location = velero_backup
            .spec
            .storage_location
            .clone()
            .unwrap_or_else(|| self.config.storage_location.clone());
        self.ensure_storage_location(&location).await?;

        self.own_restore(backup, restore).await?;

        self.delete_namespace(&workload.target_namespace()).await?;

        let velero_restore = self.velero_restore(&reference, restore);
        match self
            .restores()
            .create(&PostParams::default(), &velero_restore)
            .await
        {
            Ok(_) => tracing::info!(name, reference, "created velero restore"),
            Err(e) if is_already_exists(&e) => {}
            Err(e) => return Err(Error::Kube(e)),
        }
        restore.status_mut().restore_reference = Some(name);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(restore = restore.name_any()))]
    async fn after_restore(
        &self,
        workload: &KuberLogicService,
        restore: &KuberlogicServiceRestore,
    ) -> Result<(), Error> {
        self.delete_paused_pods(&workload.target_namespace()).await
    }

    #[tracing::instrument(skip_all, fields(restore = restore.name_any()))]
    async fn set_kuberlogic_restore_status(
        &self,
        restore: &mut KuberlogicServiceRestore,
    ) -> Result<(), Error> {
        let reference = restore
            .status
            .as_ref()
            .and_then(|s| s.restore_reference.clone())
            .unwrap_or_else(|| restore.name_any());
        let velero_restore = self
            .restores()
            .get_opt(&reference)
            .await
            .map_err(Error::Kube)?;
        let (phase, reason) = restore_phase(velero_restore.as_ref());
        restore.status_mut().set_phase(phase, reason);
        Ok(())
    }
}

fn backup_reference(backup: &KuberlogicServiceBackup) -> String {
    backup
        .status
        .as_ref()
        .and_then(|s| s.backup_reference.clone())
        .unwrap_or_else(|| backup.name_any())
}

pub fn storage_location_available(
    location: &BackupStorageLocation,
    now: DateTime<Utc>,
    ttl: Duration,
) -> bool {
    let Some(status) = location.status.as_ref() else {
        return false;
    };
    if status.phase.ne(&Some(BackupStorageLocationPhase::Available)) {
        return false;
    }
    match (
        status.last_validation_time.as_ref(),
        chrono::Duration::from_std(ttl),
    ) {
        (Some(validated), Ok(ttl)) => now.signed_duration_since(validated.0) < ttl,
        _ => false,
    }
}

pub fn backup_phase(backup: Option<&Backup>) -> (Phase, Option<String>) {
    let Some(backup) = backup else {
        return (Phase::Pending, None);
    };
    let status = backup.status.clone().unwrap_or_default();
    match status.phase {
        Some(BackupPhase::Completed) if status.completion_timestamp.is_some() => {
            let progress = status.progress.unwrap_or_default();
            if progress.items_backed_up.eq(&progress.total_items) {
                (Phase::Successful, None)
            } else {
                (
                    Phase::Failed,
                    Some(format!(
                        "backed up {} of {} items",
                        progress.items_backed_up.unwrap_or(0),
                        progress.total_items.unwrap_or(0)
                    )),
                )
            }
        }
        Some(phase) if phase.is_failure() => (
            Phase::Failed,
            Some(status.failure_reason.unwrap_or_else(|| phase.to_string())),
        ),
        _ => (Phase::Requested, None),
    }
}

pub fn restore_phase(restore: Option<&Restore>) -> (Phase, Option<String>) {
    let Some(restore) = restore else {
        return (Phase::Pending, None);
    };
    let status = restore.status.clone().unwrap_or_default();
    match status.phase {
        Some(RestorePhase::Completed) if status.completion_timestamp.is_some() => {
            match status.errors.unwrap_or(0) {
                0 => (Phase::Successful, None),
                errors => (
                    Phase::Failed,
                    Some(format!("restore completed with {errors} errors")),
                ),
            }
        }
        Some(phase) if phase.is_failure() => (
            Phase::Failed,
            Some(status.failure_reason.unwrap_or_else(|| phase.to_string())),
        ),
        _ => (Phase::Requested, None),
    }
}

pub fn delete_request_fulfilled(request: &DeleteBackupRequest) -> bool {
    request.metadata.deletion_timestamp.is_some()
        || request
            .status
            .as_ref()
            .and_then(|s| s.phase)
            .eq(&Some(DeleteBackupRequestPhase::Processed))
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or(POD_PHASE_PENDING)
}

/// Names of the workload pods still running, the backup pod aside.
/// A pod whose phase is `Unknown` may still run on its node and is counted.
pub fn running_pods(pods: &[Pod]) -> Vec<String> {
    pods.iter()
        .filter(|p| p.name_any().ne(BACKUP_POD_NAME))
        .filter(|p| {
            !matches!(
                pod_phase(p),
                POD_PHASE_PENDING | POD_PHASE_SUCCEEDED | POD_PHASE_FAILED
            )
        })
        .map(|p| p.name_any())
        .collect()
}

/// Idle pod mounting every claim read-only so Velero can copy the volumes.
pub fn backup_pod(namespace: &str, claims: &[String], owner: &KuberlogicServiceBackup) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(BACKUP_POD_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                BACKUP_VOLUMES_ANNOTATION.to_string(),
                claims.join(","),
            )])),
            owner_references: Some(vec![create_owner_reference(owner)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: BACKUP_POD_CONTAINER.to_string(),
                image: Some(BACKUP_POD_IMAGE.to_string()),
                command: Some(vec![
                    "sleep".to_string(),
                    BACKUP_POD_SLEEP_SECONDS.to_string(),
                ]),
                volume_mounts: Some(
                    claims
                        .iter()
                        .map(|claim| VolumeMount {
                            name: claim.clone(),
                            mount_path: format!("/{claim}"),
                            read_only: Some(true),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }],
            volumes: Some(
                claims
                    .iter()
                    .map(|claim| Volume {
                        name: claim.clone(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: claim.clone(),
                            read_only: Some(true),
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;
    use rstest::rstest;

    use crate::{
        controller::config::BackupConfig,
        crd::{
            backup::KUBERLOGIC_SERVICE_BACKUP_FINALIZER,
            phase::Phase,
            velero::{
                Backup, BackupPhase, BackupProgress, BackupStatus, BackupStorageLocation,
                BackupStorageLocationPhase, BackupStorageLocationSpec,
                BackupStorageLocationStatus, DeleteBackupRequest, Restore, RestorePhase,
                RestoreStatus,
            },
        },
        fixture::reconciler::{
            api_server_response_status_success, mock_client, test_kls, test_klb, test_klr,
            test_pod, test_velero_backup, timeout_after_1s,
        },
    };

    use super::*;

    fn test_config() -> BackupConfig {
        BackupConfig {
            poll_interval_millis: 0,
            poll_attempts: 2,
            ..Default::default()
        }
    }

    fn storage_location(
        phase: BackupStorageLocationPhase,
        validated_ago: i64,
    ) -> BackupStorageLocation {
        BackupStorageLocation {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                namespace: Some("velero".to_string()),
                ..Default::default()
            },
            spec: BackupStorageLocationSpec::default(),
            status: Some(BackupStorageLocationStatus {
                phase: Some(phase),
                last_validation_time: Some(Time(
                    Utc::now() - chrono::Duration::minutes(validated_ago),
                )),
            }),
        }
    }

    fn completed_backup(backed_up: i32, total: i32) -> Backup {
        let mut b = test_velero_backup();
        b.status = Some(BackupStatus {
            phase: Some(BackupPhase::Completed),
            completion_timestamp: Some(Time(Utc::now())),
            progress: Some(BackupProgress {
                total_items: Some(total),
                items_backed_up: Some(backed_up),
            }),
            ..Default::default()
        });
        b
    }

    #[rstest(
        location,
        expected,
        case(storage_location(BackupStorageLocationPhase::Available, 1), true),
        case(storage_location(BackupStorageLocationPhase::Available, 16), false),
        case(storage_location(BackupStorageLocationPhase::Unavailable, 1), false)
    )]
    fn works_storage_location_available(location: BackupStorageLocation, expected: bool) {
        assert_eq!(
            expected,
            storage_location_available(&location, Utc::now(), Duration::from_secs(15 * 60))
        );
    }

    #[test]
    fn storage_location_without_status_is_unavailable() {
        let mut location = storage_location(BackupStorageLocationPhase::Available, 0);
        location.status = None;
        assert!(!storage_location_available(
            &location,
            Utc::now(),
            Duration::from_secs(15 * 60)
        ));
    }

    #[rstest(
        backup,
        expected,
        case(None, Phase::Pending),
        case(Some(completed_backup(5, 5)), Phase::Successful),
        case(Some(completed_backup(4, 5)), Phase::Failed),
        case(Some(test_velero_backup()), Phase::Requested)
    )]
    fn works_backup_phase(backup: Option<Backup>, expected: Phase) {
        let (phase, _) = backup_phase(backup.as_ref());
        assert_eq!(expected, phase);
    }

    #[test]
    fn failed_backup_phase_records_reason() {
        let mut b = test_velero_backup();
        b.status = Some(BackupStatus {
            phase: Some(BackupPhase::PartiallyFailed),
            ..Default::default()
        });
        assert_eq!(
            (Phase::Failed, Some("PartiallyFailed".to_string())),
            backup_phase(Some(&b))
        );
    }

    #[rstest(
        phase,
        completed,
        errors,
        expected,
        case(Some(RestorePhase::Completed), true, None, Phase::Successful),
        case(Some(RestorePhase::Completed), true, Some(2), Phase::Failed),
        case(Some(RestorePhase::Failed), false, None, Phase::Failed),
        case(Some(RestorePhase::InProgress), false, None, Phase::Requested),
        case(None, false, None, Phase::Requested)
    )]
    fn works_restore_phase(
        phase: Option<RestorePhase>,
        completed: bool,
        errors: Option<i32>,
        expected: Phase,
    ) {
        let restore = Restore {
            metadata: ObjectMeta {
                name: Some("r1".to_string()),
                namespace: Some("velero".to_string()),
                ..Default::default()
            },
            spec: RestoreSpec::default(),
            status: Some(RestoreStatus {
                phase,
                completion_timestamp: completed.then(|| Time(Utc::now())),
                errors,
                ..Default::default()
            }),
        };
        assert_eq!(expected, restore_phase(Some(&restore)).0);
    }

    #[test]
    fn missing_restore_is_pending() {
        assert_eq!((Phase::Pending, None), restore_phase(None));
    }

    #[test]
    fn works_running_pods() {
        let pods = vec![
            test_pod("db-0", Some("Running")),
            test_pod("db-1", Some("Pending")),
            test_pod("db-2", None),
            test_pod("job-0", Some("Succeeded")),
            test_pod("db-3", Some("Unknown")),
            test_pod(BACKUP_POD_NAME, Some("Running")),
        ];
        assert_eq!(
            vec!["db-0".to_string(), "db-3".to_string()],
            running_pods(&pods)
        );
    }

    #[test]
    fn backup_pod_mounts_every_claim_read_only() {
        let klb = test_klb();
        let claims = vec!["data-db-0".to_string(), "data-db-1".to_string()];
        let pod = backup_pod("demo", &claims, &klb);

        assert_eq!(Some(BACKUP_POD_NAME.to_string()), pod.metadata.name);
        assert_eq!(
            "data-db-0,data-db-1",
            pod.annotations().get(BACKUP_VOLUMES_ANNOTATION).unwrap()
        );
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        assert_eq!(BACKUP_POD_CONTAINER, container.name);
        assert_eq!(Some("alpine".to_string()), container.image);
        assert_eq!(
            Some(vec!["sleep".to_string(), "3600".to_string()]),
            container.command
        );
        let mounts = container.volume_mounts.clone().unwrap();
        assert_eq!("/data-db-1", mounts[1].mount_path);
        assert!(mounts.iter().all(|m| m.read_only == Some(true)));
        let volumes = spec.volumes.unwrap();
        assert_eq!(
            "data-db-0",
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name
        );
    }

    #[test]
    fn works_delete_request_fulfilled() {
        let mut request = DeleteBackupRequest {
            metadata: ObjectMeta {
                name: Some("b1".to_string()),
                namespace: Some("velero".to_string()),
                ..Default::default()
            },
            spec: DeleteBackupRequestSpec {
                backup_name: "b1".to_string(),
            },
            status: None,
        };
        assert!(!delete_request_fulfilled(&request));
        request.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(delete_request_fulfilled(&request));
    }

    fn pod_list(pods: Vec<Pod>) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {},
            "items": pods,
        }))
        .unwrap()
    }

    fn test_delete_backup_request() -> DeleteBackupRequest {
        DeleteBackupRequest {
            metadata: ObjectMeta {
                name: Some("b1".to_string()),
                namespace: Some("velero".to_string()),
                ..Default::default()
            },
            spec: DeleteBackupRequestSpec {
                backup_name: "b1".to_string(),
            },
            status: None,
        }
    }

    fn test_velero_restore() -> Restore {
        Restore {
            metadata: ObjectMeta {
                name: Some("r1".to_string()),
                namespace: Some("velero".to_string()),
                ..Default::default()
            },
            spec: RestoreSpec::default(),
            status: None,
        }
    }

    #[tokio::test]
    async fn backup_request_fails_on_unavailable_storage() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let kls = test_kls("demo", "", "");
        let mut klb = test_klb();

        let mocksvr = tokio::spawn(async move {
            fakeserver.handle_get_not_found(&test_velero_backup()).await;
            fakeserver
                .handle_get(&storage_location(BackupStorageLocationPhase::Unavailable, 1))
                .await;
        });

        let res = velero.backup_request(&kls, &mut klb).await;
        assert!(matches!(res, Err(Error::StorageUnavailable(name)) if name == "default"));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn backup_request_is_idempotent_when_backup_exists() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let kls = test_kls("demo", "", "");
        let mut klb = test_klb();

        let mocksvr = tokio::spawn(async move {
            fakeserver.handle_get(&test_velero_backup()).await;
        });

        velero.backup_request(&kls, &mut klb).await.unwrap();
        assert_eq!(
            Some("b1".to_string()),
            klb.status.unwrap().backup_reference
        );
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn backup_request_with_snapshots_creates_velero_backup() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(
            client,
            BackupConfig {
                snapshots_enabled: true,
                ..test_config()
            },
        );
        let kls = test_kls("demo", "", "");
        let mut klb = test_klb();

        let mocksvr = tokio::spawn(async move {
            let backup = test_velero_backup();
            fakeserver.handle_get_not_found(&backup).await;
            fakeserver
                .handle_get(&storage_location(BackupStorageLocationPhase::Available, 1))
                .await;
            let created = fakeserver.handle_create(&backup).await;
            assert_eq!(vec!["demo".to_string()], created.spec.included_namespaces);
            assert_eq!(Some(true), created.spec.snapshot_volumes);
        });

        velero.backup_request(&kls, &mut klb).await.unwrap();
        assert_eq!(
            Some("b1".to_string()),
            klb.status.unwrap().backup_reference
        );
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn set_backup_status_reports_pending_without_velero_backup() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let mut klb = test_klb();

        let mocksvr = tokio::spawn(async move {
            fakeserver.handle_get_not_found(&test_velero_backup()).await;
        });

        velero.set_kuberlogic_backup_status(&mut klb).await.unwrap();
        assert_eq!(Phase::Pending, klb.status.unwrap().phase);
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn set_backup_status_reports_successful_backup() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let mut klb = test_klb();

        let mocksvr = tokio::spawn(async move {
            fakeserver.handle_get(&completed_backup(5, 5)).await;
        });

        velero.set_kuberlogic_backup_status(&mut klb).await.unwrap();
        let status = klb.status.unwrap();
        assert_eq!(Phase::Successful, status.phase);
        assert!(status.last_transition_time.is_some());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn pause_pods_force_deletes_running_pods() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());

        let mocksvr = tokio::spawn(async move {
            let running = test_pod("db-0", Some("Running"));
            fakeserver
                .handle_list(&running, pod_list(vec![running.clone()]))
                .await;
            let options = fakeserver
                .handle_delete(&running, false, serde_json::to_vec(&running).unwrap())
                .await;
            assert_eq!(serde_json::json!(0), options["gracePeriodSeconds"]);

            let paused = test_pod("db-0", Some("Pending"));
            fakeserver
                .handle_list(&paused, pod_list(vec![paused.clone()]))
                .await;
        });

        velero.pause_pods("demo").await.unwrap();
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn pause_pods_gives_up_after_poll_attempts() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());

        let mocksvr = tokio::spawn(async move {
            let running = test_pod("db-0", Some("Running"));
            for _ in 0..2 {
                fakeserver
                    .handle_list(&running, pod_list(vec![running.clone()]))
                    .await;
                fakeserver
                    .handle_delete(&running, false, serde_json::to_vec(&running).unwrap())
                    .await;
            }
        });

        let res = velero.pause_pods("demo").await;
        assert!(matches!(res, Err(Error::PodsNotPaused(ns)) if ns == "demo"));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn after_backup_is_idempotent() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let kls = test_kls("demo", "", "");
        let klb = test_klb();

        let mocksvr = tokio::spawn(async move {
            let helper = test_pod(BACKUP_POD_NAME, Some("Running"));
            fakeserver.handle_get(&helper).await;
            fakeserver
                .handle_delete(&helper, true, api_server_response_status_success())
                .await;
            // the second run only looks for the backup pod
            fakeserver.handle_get_not_found(&helper).await;
        });

        velero.after_backup(&kls, &klb).await.unwrap();
        velero.after_backup(&kls, &klb).await.unwrap();
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn after_backup_does_nothing_with_snapshots() {
        let (client, _fakeserver) = mock_client();
        let velero = Velero::new(
            client,
            BackupConfig {
                snapshots_enabled: true,
                ..test_config()
            },
        );
        velero
            .after_backup(&test_kls("demo", "", ""), &test_klb())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backup_delete_request_creates_request_with_finalizer() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let mut klb = test_klb();
        klb.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mocksvr = tokio::spawn(async move {
            let request = test_delete_backup_request();
            fakeserver.handle_get_not_found(&request).await;
            fakeserver.handle_get(&completed_backup(5, 5)).await;
            let created = fakeserver.handle_create(&request).await;
            assert_eq!(
                Some(vec![KUBERLOGIC_SERVICE_BACKUP_FINALIZER.to_string()]),
                created.metadata.finalizers
            );
            assert_eq!("b1", created.spec.backup_name);
        });

        let res = velero.backup_delete_request(&klb).await;
        assert!(matches!(res, Err(Error::DeletionPending(name)) if name.eq("b1")));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn backup_delete_request_waits_for_velero() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let mut klb = test_klb();
        klb.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mocksvr = tokio::spawn(async move {
            fakeserver.handle_get(&test_delete_backup_request()).await;
        });

        let res = velero.backup_delete_request(&klb).await;
        assert!(matches!(res, Err(Error::DeletionPending(_))));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn backup_delete_request_clears_request_finalizer_once_fulfilled() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let mut klb = test_klb();
        klb.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mocksvr = tokio::spawn(async move {
            let mut request = test_delete_backup_request();
            request.metadata.finalizers = Some(vec![KUBERLOGIC_SERVICE_BACKUP_FINALIZER.to_string()]);
            request.metadata.deletion_timestamp = Some(Time(Utc::now()));
            fakeserver.handle_get(&request).await;

            let expected = serde_json::json!([
                { "op": "test", "path": "/metadata/finalizers/0", "value": KUBERLOGIC_SERVICE_BACKUP_FINALIZER },
                { "op": "remove", "path": "/metadata/finalizers/0" }
            ]);
            assert_eq!(expected, fakeserver.handle_patch(&request).await);
        });

        velero.backup_delete_request(&klb).await.unwrap();
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn backup_delete_request_without_velero_backup_is_done() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let mut klb = test_klb();
        klb.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mocksvr = tokio::spawn(async move {
            fakeserver
                .handle_get_not_found(&test_delete_backup_request())
                .await;
            fakeserver.handle_get_not_found(&test_velero_backup()).await;
        });

        velero.backup_delete_request(&klb).await.unwrap();
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn restore_request_requires_successful_backup() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let kls = test_kls("demo", "", "");
        let klb = test_klb();
        let mut klr = test_klr();

        let mocksvr = tokio::spawn(async move {
            fakeserver.handle_get_not_found(&test_velero_restore()).await;
            let mut b = test_velero_backup();
            b.status = Some(BackupStatus {
                phase: Some(BackupPhase::Failed),
                ..Default::default()
            });
            fakeserver.handle_get(&b).await;
            // no restore may be created
        });

        let res = velero.restore_request(&kls, &klb, &mut klr).await;
        assert!(matches!(res, Err(Error::BackupNotSuccessful(name)) if name == "b1"));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn restore_request_is_idempotent_when_restore_exists() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let kls = test_kls("demo", "", "");
        let klb = test_klb();
        let mut klr = test_klr();

        let mocksvr = tokio::spawn(async move {
            fakeserver.handle_get(&test_velero_restore()).await;
        });

        velero.restore_request(&kls, &klb, &mut klr).await.unwrap();
        assert_eq!(
            Some("r1".to_string()),
            klr.status.unwrap().restore_reference
        );
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn set_restore_status_reads_velero_restore() {
        let (client, mut fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let mut klr = test_klr();

        let mocksvr = tokio::spawn(async move {
            let mut restore = test_velero_restore();
            restore.status = Some(RestoreStatus {
                phase: Some(RestorePhase::PartiallyFailed),
                failure_reason: Some("volume not found".to_string()),
                ..Default::default()
            });
            fakeserver.handle_get(&restore).await;
        });

        velero.set_kuberlogic_restore_status(&mut klr).await.unwrap();
        let status = klr.status.unwrap();
        assert_eq!(Phase::Failed, status.phase);
        assert_eq!(Some("volume not found".to_string()), status.reason);
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn velero_restore_excludes_cluster_resources() {
        let (client, _fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let restore = velero.velero_restore("b1", &test_klr());
        assert_eq!("b1", restore.spec.backup_name);
        assert_eq!(vec!["*".to_string()], restore.spec.included_namespaces);
        assert!(restore
            .spec
            .excluded_resources
            .contains(&"resticrepositories.velero.io".to_string()));
        assert_eq!(6, restore.spec.excluded_resources.len());
    }

    #[tokio::test]
    async fn velero_backup_is_scoped_to_workload_namespace() {
        let (client, _fakeserver) = mock_client();
        let velero = Velero::new(client, test_config());
        let backup = velero.velero_backup("demo", &test_klb());
        assert_eq!(Some("velero".to_string()), backup.metadata.namespace);
        assert_eq!(vec!["demo".to_string()], backup.spec.included_namespaces);
        assert_eq!(Some(false), backup.spec.snapshot_volumes);
        assert_eq!(
            "KuberlogicServiceBackup",
            backup.metadata.owner_references.unwrap()[0].kind
        );
    }
}
