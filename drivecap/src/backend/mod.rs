//! Collaborator implementations.
//!
//! - [`memory`]: in-memory device, stores and upstream with fault injection
//! - [`file`]: image-file device and file-backed stores used by the command-line tool

pub mod file;
pub mod memory;

pub use crate::admission::LoadScheduler;
pub use file::{DetachedUpstream, FileDevice, FileNonPagedStore, FilePagedStore};
pub use memory::{
    MediaDefect, MemoryDevice, MemoryNonPagedStore, MemoryPagedStore, ScriptedUpstream,
    poison_writes,
};
