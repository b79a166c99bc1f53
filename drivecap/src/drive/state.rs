//! Drive lifecycle status and state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a drive.
///
/// ```text
/// create()/open() → Ready
/// quiesce()       → Quiesced (background cycles abandon their work)
/// unquiesce()     → Ready
/// destroy()       → Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveStatus {
    /// Accepting foreground requests; background engines may run.
    Ready,

    /// Not operational. In-flight background cycles drop their results
    /// and restart from the last durable checkpoint once Ready again.
    Quiesced,

    /// Background tasks stopped and metadata flushed. Terminal.
    Destroyed,
}

impl DriveStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, DriveStatus::Ready)
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, DriveStatus::Destroyed)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: DriveStatus) -> bool {
        use DriveStatus::*;
        matches!(
            (self, target),
            (Ready, Quiesced) | (Quiesced, Ready) | (Ready, Destroyed) | (Quiesced, Destroyed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriveStatus::Ready => "ready",
            DriveStatus::Quiesced => "quiesced",
            DriveStatus::Destroyed => "destroyed",
        }
    }
}

impl std::str::FromStr for DriveStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(DriveStatus::Ready),
            "quiesced" => Ok(DriveStatus::Quiesced),
            "destroyed" => Ok(DriveStatus::Destroyed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
