//! Drive lifecycle, configuration and the background runner.

pub mod lock;
pub mod options;
pub(crate) mod runner;
pub mod state;
pub mod types;

mod core;

pub use core::{Drive, DriveCollaborators};
pub(crate) use core::DriveInner;
pub use lock::HomeLock;
pub use options::{DeviceCapabilities, DriveOptions};
pub use state::DriveStatus;
pub use types::{ChunkCounts, CycleOutcome, DeferReason, DriveSnapshot, Engine, ZeroRequest};
