#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Chunk geometry small enough that whole-image passes stay fast.
pub const CHUNKS: u64 = 4;
pub const CHUNK_SIZE: u64 = 64;
pub const BLOCK_SIZE: usize = 512;

pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// Fresh command against the same home.
    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_drivecap");
        let mut cmd = Command::new(bin_path);
        cmd.timeout(Duration::from_secs(60));
        cmd.arg("--home").arg(self.home.path());
        cmd
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.home.path().join(file)
    }

    /// Provision the default small drive.
    pub fn init(&self) {
        self.new_cmd()
            .args([
                "init",
                "--chunks",
                &CHUNKS.to_string(),
                "--chunk-size",
                &CHUNK_SIZE.to_string(),
            ])
            .assert()
            .success();
    }

    /// Overwrite the whole device image with `byte`.
    pub fn fill_image(&self, byte: u8) {
        let path = self.path("disk.img");
        let len = std::fs::metadata(&path).expect("Failed to stat image").len();
        std::fs::write(&path, vec![byte; len as usize]).expect("Failed to fill image");
    }

    /// Contents of one block of the device image.
    pub fn block(&self, lba: u64) -> Vec<u8> {
        read_block(&self.path("disk.img"), lba)
    }

    pub fn status_json(&self) -> serde_json::Value {
        let output = self
            .new_cmd()
            .args(["status", "--format", "json"])
            .output()
            .expect("Failed to run status");
        assert!(output.status.success(), "status failed: {:?}", output);
        serde_json::from_slice(&output.stdout).expect("Failed to parse status JSON")
    }
}

pub fn read_block(path: &Path, lba: u64) -> Vec<u8> {
    let bytes = std::fs::read(path).expect("Failed to read image");
    let start = lba as usize * BLOCK_SIZE;
    bytes[start..start + BLOCK_SIZE].to_vec()
}

pub fn drivecap() -> TestContext {
    let home = TempDir::new().expect("Failed to create temp home");
    let bin_path: &str = env!("CARGO_BIN_EXE_drivecap");
    let mut cmd = Command::new(bin_path);
    // You can override this with .timeout(Duration::from_secs(N))
    cmd.timeout(Duration::from_secs(60));
    cmd.arg("--home").arg(home.path());

    TestContext { cmd, home }
}
