use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use drivecap_shared::constants::envs::DRIVECAP_HOME;

use crate::commands::{init, run, scrub, status, verify_invalidate, zero};

#[derive(Parser, Debug)]
#[command(name = "drivecap", version, about = "Manage file-backed DriveCap drives")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Drive home directory (default: ~/.drivecap)
    #[arg(long, global = true, env = DRIVECAP_HOME)]
    pub home: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, global = true)]
    pub debug: bool,
}

impl GlobalFlags {
    pub fn home_dir(&self) -> PathBuf {
        match &self.home {
            Some(home) => home.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".drivecap"),
        }
    }

    pub fn log_filter(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a new drive in the home directory
    Init(init::InitArgs),

    /// Zero a block range
    Zero(zero::ZeroArgs),

    /// Mark the whole drive for zeroing again
    Scrub(scrub::ScrubArgs),

    /// Rebuild chunk records from the metadata page holding an lba
    VerifyInvalidate(verify_invalidate::VerifyInvalidateArgs),

    /// Run background engines
    Run(run::RunArgs),

    /// Show drive state
    Status(status::StatusArgs),
}

/// Parse a decimal or `0x`-prefixed block address.
pub fn parse_lba(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid block number '{}': {}", value, e))
}
