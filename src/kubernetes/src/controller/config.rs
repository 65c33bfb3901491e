use std::{fs, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    config::Tls,
    crd::velero::{DEFAULT_STORAGE_LOCATION, VELERO_NAMESPACE},
};

use super::error::{ConfigError, Error};

use klbrd_cert::constants::{DEFAULT_TLS_CERT, DEFAULT_TLS_KEY};

pub const DEFAULT_HTTP_PORT: u32 = 8080;
pub const DEFAULT_HTTPS_PORT: u32 = 8443;
pub const DEFAULT_REQUEUE_INTERVAL: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_MILLIS: u64 = 1000;
pub const DEFAULT_POLL_ATTEMPTS: u32 = 60;
pub const DEFAULT_MAX_FAILED_ATTEMPTS: i32 = 10;
pub const DEFAULT_EXCLUSION_REQUEUE: u64 = 30;
pub const DEFAULT_RESTORE_DEADLINE: u64 = 60 * 60;
pub const DEFAULT_STORAGE_LOCATION_TTL: u64 = 15 * 60;
pub const DEFAULT_SCHEDULER_IMAGE: &str = "bitnami/kubectl:1.28";
pub const DEFAULT_SCHEDULER_SERVICE_ACCOUNT: &str = "klbrd-backup-scheduler";

#[derive(Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub http_port: u32,
    pub https_port: u32,
    pub tls: Tls,
    pub requeue_interval: u64,
    pub backups: BackupConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackupConfig {
    pub enabled: bool,
    pub snapshots_enabled: bool,
    pub velero_namespace: String,
    pub storage_location: String,
    pub poll_interval_millis: u64,
    pub poll_attempts: u32,
    pub max_failed_attempts: i32,
    /// Seconds to wait before retrying a request blocked by another operation
    pub exclusion_requeue: u64,
    /// Seconds after which an unsuccessful restore is given up
    pub restore_deadline: u64,
    /// Seconds a storage location validation stays trustworthy
    pub storage_location_ttl: u64,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub image: String,
    pub service_account: String,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|_| Error::Config(ConfigError::FailedToLoad))?;
        config.backups.validate()?;
        Ok(config)
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_attempts == 0 {
            return Err(Error::Config(ConfigError::InvalidArgument(
                "pollAttempts must be greater than 0".to_string(),
            )));
        }
        if self.max_failed_attempts <= 0 {
            return Err(Error::Config(ConfigError::InvalidArgument(
                "maxFailedAttempts must be greater than 0".to_string(),
            )));
        }
        if self.velero_namespace.is_empty() || self.storage_location.is_empty() {
            return Err(Error::Config(ConfigError::InvalidArgument(
                "veleroNamespace and storageLocation must not be empty".to_string(),
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn exclusion_requeue(&self) -> Duration {
        Duration::from_secs(self.exclusion_requeue)
    }

    pub fn restore_deadline(&self) -> Duration {
        Duration::from_secs(self.restore_deadline)
    }

    pub fn storage_location_ttl(&self) -> Duration {
        Duration::from_secs(self.storage_location_ttl)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            tls: Tls {
                cert: DEFAULT_TLS_CERT.to_string(),
                key: DEFAULT_TLS_KEY.to_string(),
            },
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            backups: BackupConfig::default(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshots_enabled: false,
            velero_namespace: VELERO_NAMESPACE.to_string(),
            storage_location: DEFAULT_STORAGE_LOCATION.to_string(),
            poll_interval_millis: DEFAULT_POLL_INTERVAL_MILLIS,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            exclusion_requeue: DEFAULT_EXCLUSION_REQUEUE,
            restore_deadline: DEFAULT_RESTORE_DEADLINE,
            storage_location_ttl: DEFAULT_STORAGE_LOCATION_TTL,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SCHEDULER_IMAGE.to_string(),
            service_account: DEFAULT_SCHEDULER_SERVICE_ACCOUNT.to_string(),
        }
    }
}
