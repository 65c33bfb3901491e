pub mod backup;
pub mod backup_schedule;
pub mod phase;
pub mod restore;
pub mod service;
pub mod velero;
