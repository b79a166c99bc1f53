//! Layout of a drive home directory.
//!
//! ```text
//! <home>/
//!   .lock          exclusive lock held while a command runs
//!   drive.json     drive options
//!   disk.img       device image
//!   chunkmap.bin   packed chunk records
//!   nonpaged.json  checkpoints, flags and the sniff report
//!   logs/          daily-rotated logs
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use drivecap::backend::{
    DetachedUpstream, FileDevice, FileNonPagedStore, FilePagedStore, LoadScheduler,
};
use drivecap::{Drive, DriveCollaborators, DriveOptions, HomeLock};

pub const LOG_DIR: &str = "logs";
const OPTIONS_FILE: &str = "drive.json";
const IMAGE_FILE: &str = "disk.img";
const CHUNK_MAP_FILE: &str = "chunkmap.bin";
const NON_PAGED_FILE: &str = "nonpaged.json";

/// A locked drive home.
pub struct DriveHome {
    root: PathBuf,
    _lock: HomeLock,
}

impl DriveHome {
    pub fn lock(root: &Path) -> anyhow::Result<Self> {
        let lock = HomeLock::acquire(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn options_path(&self) -> PathBuf {
        self.root.join(OPTIONS_FILE)
    }

    pub fn has_drive(&self) -> bool {
        self.options_path().exists()
    }

    /// Provision a drive. The options file is written last, so a failed
    /// create leaves no drive behind.
    pub async fn create(&self, options: &DriveOptions) -> anyhow::Result<Drive> {
        options.validate()?;
        let collaborators = DriveCollaborators {
            device: Arc::new(
                FileDevice::create(self.root.join(IMAGE_FILE), options.capacity_blocks).await?,
            ),
            paged: Arc::new(
                FilePagedStore::create(self.root.join(CHUNK_MAP_FILE), options.capacity_chunks())
                    .await?,
            ),
            nonpaged: Arc::new(FileNonPagedStore::create(self.root.join(NON_PAGED_FILE)).await?),
            upstream: Arc::new(DetachedUpstream),
            scheduler: Arc::new(LoadScheduler::default()),
        };
        let drive = Drive::create(options.clone(), collaborators).await?;
        drive.flush().await?;
        options.to_json_file(&self.options_path())?;
        Ok(drive)
    }

    pub async fn open(&self) -> anyhow::Result<Drive> {
        if !self.has_drive() {
            anyhow::bail!(
                "no drive in {}; run 'drivecap init' first",
                self.root.display()
            );
        }
        let options = DriveOptions::from_json_file(&self.options_path())
            .with_context(|| format!("failed to load {}", self.options_path().display()))?;
        let collaborators = DriveCollaborators {
            device: Arc::new(
                FileDevice::open(self.root.join(IMAGE_FILE), options.capacity_blocks).await?,
            ),
            paged: Arc::new(
                FilePagedStore::open(self.root.join(CHUNK_MAP_FILE), options.capacity_chunks())
                    .await?,
            ),
            nonpaged: Arc::new(FileNonPagedStore::open(self.root.join(NON_PAGED_FILE)).await?),
            upstream: Arc::new(DetachedUpstream),
            scheduler: Arc::new(LoadScheduler::default()),
        };
        Ok(Drive::open(options, collaborators).await?)
    }
}
