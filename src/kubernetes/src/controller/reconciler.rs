pub mod backup;
pub mod backup_schedule;
pub mod restore;
pub mod status;
pub mod tracker;

use std::{any::Any, sync::Arc};

use kube::{runtime::reflector::ObjectRef, Resource, ResourceExt};

use super::{config::BackupConfig, lock::KeyedLock, provider::BackupProvider};

/// Shared by the backup and restore reconcilers.
#[derive(Clone)]
pub struct Component {
    pub provider: Arc<dyn BackupProvider>,
    pub locks: Arc<KeyedLock>,
    pub config: BackupConfig,
}

impl Component {
    pub fn new(provider: Arc<dyn BackupProvider>, config: BackupConfig) -> Self {
        Self {
            provider,
            locks: Arc::new(KeyedLock::new()),
            config,
        }
    }
}

/// Map an object to the cluster scoped `K` controlling it.
///
/// Owned objects live in other namespaces than their cluster scoped owner, so
/// the owner reference is resolved without a namespace.
pub fn controller_of<K, O>(obj: O) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
    O: Resource,
{
    let kind = K::kind(&());
    obj.owner_references()
        .iter()
        .find(|r| r.controller.unwrap_or(false) && r.kind.eq(&kind))
        .map(|r| ObjectRef::new(&r.name))
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
