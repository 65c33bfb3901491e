pub mod backup;
pub mod pod;
