//! Workload state tracking.
//!
//! The active backup and restore of a workload live in its status. They are
//! read and written here only, and every write goes through [`update_status`]
//! so concurrent writers of the workload status do not clobber each other.

use kube::Api;

use crate::{
    controller::error::Error,
    crd::service::{Blocker, KuberLogicService},
    util::is_not_found,
};

use super::status::update_status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

/// Record `request` as the active `op` of `workload`.
///
/// Returns the workload, or the operation blocking it. The workload is left
/// untouched when blocked.
#[tracing::instrument(skip(api))]
pub async fn claim(
    api: &Api<KuberLogicService>,
    workload: &str,
    op: Operation,
    request: &str,
) -> Result<Result<KuberLogicService, Blocker>, Error> {
    let mut blocker = None;
    let res = update_status(api, workload, |kls| {
        let status = kls.status.get_or_insert_with(Default::default);
        let claimed = match op {
            Operation::Backup => status.claim_backup(request),
            Operation::Restore => status.claim_restore(request),
        };
        match claimed {
            Ok(changed) => {
                blocker = None;
                changed
            }
            Err(b) => {
                blocker = Some(b);
                false
            }
        }
    })
    .await;

    match res {
        Ok(kls) => match blocker {
            Some(b) => Ok(Err(b)),
            None => {
                tracing::info!(workload, request, operation=?op, "claimed workload");
                Ok(Ok(kls))
            }
        },
        Err(Error::Kube(e)) if is_not_found(&e) => {
            Err(Error::WorkloadNotFound(workload.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Clear the active `op` of `workload` if it is `request`.
///
/// Returns the workload, `None` when it is already gone.
#[tracing::instrument(skip(api))]
pub async fn release(
    api: &Api<KuberLogicService>,
    workload: &str,
    op: Operation,
    request: &str,
) -> Result<Option<KuberLogicService>, Error> {
    let res = update_status(api, workload, |kls| {
        let Some(status) = kls.status.as_mut() else {
            return false;
        };
        match op {
            Operation::Backup => status.release_backup(request),
            Operation::Restore => status.release_restore(request),
        }
    })
    .await;

    match res {
        Ok(kls) => Ok(Some(kls)),
        Err(Error::Kube(e)) if is_not_found(&e) => {
            tracing::info!(workload, "workload is already gone");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
