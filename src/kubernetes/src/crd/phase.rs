use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle of a backup or restore request.
///
/// `Pending` is reconstructed whenever the provider side object is absent.
/// `Successful` and `Failed` are terminal.
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Pending,
    Requested,
    Successful,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Successful | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Requested => write!(f, "Requested"),
            Phase::Successful => write!(f, "Successful"),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

/// Common view over request resources that carry a phase and an attempt counter.
pub trait Progress {
    fn phase(&self) -> Phase;
    fn failed_attempts(&self) -> i32;
}
