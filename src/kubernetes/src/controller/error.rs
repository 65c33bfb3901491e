use klbrd_trace::error::TraceableError;
use kube::runtime::finalizer;
use thiserror::Error;

use crate::util;

/// How a reconcile error is handled by the error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Surfaced immediately and never retried.
    Validation,
    /// Retried with backoff, counted toward the attempt limit.
    TransientInfra,
    /// A dependency is missing; retried without counting.
    NotFound,
    /// Optimistic concurrency failure; retried quickly.
    Conflict,
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("std::io::Error")]
    StdIo(#[from] std::io::Error),

    #[error("config error")]
    Config(#[from] ConfigError),

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Kube Library Error: {0}")]
    KubeLibrary(#[source] crate::error::Error),

    #[error("Metrics Error: {0}")]
    Metrics(#[source] prometheus::Error),

    #[error("Trace Error: {0}")]
    Trace(#[source] klbrd_trace::error::Error),

    #[error("TLS Error: {0}")]
    Tls(String),

    #[error("backup storage location {0} is unavailable")]
    StorageUnavailable(String),

    #[error("pods in {0} are not paused")]
    PodsNotPaused(String),

    #[error("backup pod in {0} is not ready")]
    BackupPodNotReady(String),

    #[error("namespace {0} is not deleted")]
    NamespaceNotDeleted(String),

    #[error("backup {0} is not successful")]
    BackupNotSuccessful(String),

    #[error("kuberlogicservice {0} is not found")]
    WorkloadNotFound(String),

    #[error("kuberlogicservicebackup {0} is not found")]
    BackupNotFound(String),

    #[error("backups are disabled")]
    BackupsDisabled,

    #[error("deletion of {0} is still in progress")]
    DeletionPending(String),

    #[error("Finalizer Error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<Error>>),

    #[error("status update of {0} kept conflicting")]
    Conflict(String),

    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::BackupsDisabled => ErrorClass::Validation,
            Error::StorageUnavailable(_)
            | Error::PodsNotPaused(_)
            | Error::BackupPodNotReady(_)
            | Error::NamespaceNotDeleted(_)
            | Error::BackupNotSuccessful(_)
            | Error::DeletionPending(_) => ErrorClass::TransientInfra,
            Error::WorkloadNotFound(_) | Error::BackupNotFound(_) => ErrorClass::NotFound,
            Error::Conflict(_) => ErrorClass::Conflict,
            Error::Kube(e) if util::is_not_found(e) => ErrorClass::NotFound,
            Error::Kube(e) if util::is_conflict(e) => ErrorClass::Conflict,
            Error::Kube(_) => ErrorClass::TransientInfra,
            Error::Finalizer(e) => match e.as_ref() {
                finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e)
                    if util::is_conflict(e) =>
                {
                    ErrorClass::Conflict
                }
                finalizer::Error::AddFinalizer(_) | finalizer::Error::RemoveFinalizer(_) => {
                    ErrorClass::TransientInfra
                }
                _ => ErrorClass::Internal,
            },
            _ => ErrorClass::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load")]
    FailedToLoad,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        let label = format!("{self:?}");
        label
            .split(|c: char| !c.is_alphanumeric())
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }
}
