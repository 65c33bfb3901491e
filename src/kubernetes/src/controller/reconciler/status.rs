use std::fmt::Debug;

use kube::{api::PostParams, Api, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    controller::error::Error,
    crd::{backup::KuberlogicServiceBackup, restore::KuberlogicServiceRestore},
    util::is_conflict,
};

pub const MAX_STATUS_UPDATE_RETRIES: usize = 5;

/// Re-fetch `name`, apply `mutate` and replace its status.
///
/// `mutate` returns whether it changed anything; nothing is written otherwise.
/// A write rejected because the object moved on is retried on a fresh copy.
#[tracing::instrument(skip(api, mutate))]
pub async fn update_status<T, F>(api: &Api<T>, name: &str, mut mutate: F) -> Result<T, Error>
where
    T: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: FnMut(&mut T) -> bool,
{
    for attempt in 0..MAX_STATUS_UPDATE_RETRIES {
        let mut res = api.get(name).await.map_err(Error::Kube)?;
        if !mutate(&mut res) {
            return Ok(res);
        }
        let data = serde_json::to_vec(&res).map_err(Error::Serialization)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(updated) => return Ok(updated),
            Err(e) if is_conflict(&e) => {
                tracing::debug!(name, attempt, "status update conflicted, retrying");
            }
            Err(e) => return Err(Error::Kube(e)),
        }
    }
    Err(Error::Conflict(name.to_string()))
}

/// Persist the status computed for `desired`, never lowering the stored attempt counter.
pub async fn persist_backup_status(
    api: &Api<KuberlogicServiceBackup>,
    desired: &KuberlogicServiceBackup,
) -> Result<KuberlogicServiceBackup, Error> {
    let Some(status) = desired.status.as_ref() else {
        return Ok(desired.clone());
    };
    update_status(api, &desired.name_any(), |stored| {
        let mut merged = stored.status.clone().unwrap_or_default();
        merged.merge(status);
        if stored.status.as_ref().eq(&Some(&merged)) {
            return false;
        }
        stored.status = Some(merged);
        true
    })
    .await
}

pub async fn persist_restore_status(
    api: &Api<KuberlogicServiceRestore>,
    desired: &KuberlogicServiceRestore,
) -> Result<KuberlogicServiceRestore, Error> {
    let Some(status) = desired.status.as_ref() else {
        return Ok(desired.clone());
    };
    update_status(api, &desired.name_any(), |stored| {
        let mut merged = stored.status.clone().unwrap_or_default();
        merged.merge(status);
        if stored.status.as_ref().eq(&Some(&merged)) {
            return false;
        }
        stored.status = Some(merged);
        true
    })
    .await
}
