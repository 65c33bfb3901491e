pub mod velero;

use async_trait::async_trait;

use crate::crd::{
    backup::KuberlogicServiceBackup, restore::KuberlogicServiceRestore,
    service::KuberLogicService,
};

use super::error::Error;

/// Backend performing backups and restores on behalf of the reconcilers.
///
/// Every operation is idempotent: creation steps check for existing objects
/// first and tolerate `AlreadyExists`, so an interrupted reconcile can simply
/// run again. Status setters only update the in-memory object; persisting it
/// is left to the caller.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Start a backup of `workload`, quiescing its pods first when volume
    /// snapshots are not available.
    async fn backup_request(
        &self,
        workload: &KuberLogicService,
        backup: &mut KuberlogicServiceBackup,
    ) -> Result<(), Error>;

    /// Release whatever `backup_request` left behind once the backup is terminal.
    async fn after_backup(
        &self,
        workload: &KuberLogicService,
        backup: &KuberlogicServiceBackup,
    ) -> Result<(), Error>;

    /// Refresh the phase of `backup` from the provider.
    async fn set_kuberlogic_backup_status(
        &self,
        backup: &mut KuberlogicServiceBackup,
    ) -> Result<(), Error>;

    /// Drive deletion of the provider side backup. Returns
    /// `Error::DeletionPending` until the provider confirmed it.
    async fn backup_delete_request(&self, backup: &KuberlogicServiceBackup) -> Result<(), Error>;

    /// Replace the namespace of `workload` with the content of `backup`.
    async fn restore_request(
        &self,
        workload: &KuberLogicService,
        backup: &KuberlogicServiceBackup,
        restore: &mut KuberlogicServiceRestore,
    ) -> Result<(), Error>;

    async fn after_restore(
        &self,
        workload: &KuberLogicService,
        restore: &KuberlogicServiceRestore,
    ) -> Result<(), Error>;

    /// Refresh the phase of `restore` from the provider.
    async fn set_kuberlogic_restore_status(
        &self,
        restore: &mut KuberlogicServiceRestore,
    ) -> Result<(), Error>;
}
