//! DriveCap - capacity management for provisioned drives.
//!
//! A drive sits between a raw block device and a redundant-storage consumer
//! (a RAID group, say). This crate keeps its capacity honest:
//!
//! - **Background zero** lazily zero-fills provisioned capacity so the
//!   consumer never reads stale media content.
//! - **Sniff verify** scans the media for latent defects and repairs them,
//!   either through the consumer or by write-verify remapping.
//! - **Verify-invalidate** rebuilds chunk records whose metadata page was
//!   lost, without ever zeroing data the consumer may still own.
//!
//! All three share a crash-consistent per-chunk [`chunk::ChunkRecord`] map and
//! durable checkpoints. Hardware and persistent storage are reached through the
//! traits in [`io`]; [`backend`] has in-memory and file-backed implementations.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use drivecap::backend::{
//!     LoadScheduler, MemoryDevice, MemoryNonPagedStore, MemoryPagedStore, ScriptedUpstream,
//! };
//! use drivecap::{Drive, DriveCollaborators, DriveOptions, ZeroRequest};
//!
//! # async fn example() -> drivecap::DrivecapResult<()> {
//! let options = DriveOptions::with_chunks(64);
//! let drive = Drive::create(
//!     options.clone(),
//!     DriveCollaborators {
//!         device: Arc::new(MemoryDevice::new(options.capacity_blocks)),
//!         paged: Arc::new(MemoryPagedStore::new(64, options.records_per_page)),
//!         nonpaged: Arc::new(MemoryNonPagedStore::new()),
//!         upstream: Arc::new(ScriptedUpstream::new()),
//!         scheduler: Arc::new(LoadScheduler::default()),
//!     },
//! )
//! .await?;
//!
//! drive.submit(ZeroRequest::UserZero { lba: 0, blocks: 0x800 }).await?;
//! drive.start_background()?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod backend;
pub mod checkpoint;
pub mod chunk;
pub mod drive;
pub mod io;
pub mod metadata;
pub mod metrics;
pub mod util;

mod verify;
mod zero;

pub use drive::{
    ChunkCounts, CycleOutcome, DeferReason, DeviceCapabilities, Drive, DriveCollaborators,
    DriveOptions, DriveSnapshot, DriveStatus, Engine, HomeLock, ZeroRequest,
};
pub use drivecap_shared::{DrivecapError, DrivecapResult};
pub use metrics::DriveMetrics;
pub use util::init_logging;
