use clap::Args;
use drivecap::chunk::BlockRange;
use drivecap::{DrivecapResult, Engine, ZeroRequest};

use crate::cli::parse_lba;
use crate::commands::run::run_until_idle;
use crate::home::DriveHome;

#[derive(Args, Debug)]
pub struct ZeroArgs {
    /// First block (decimal or 0x-prefixed)
    #[arg(value_parser = parse_lba)]
    pub lba: u64,

    /// Number of blocks (decimal or 0x-prefixed)
    #[arg(value_parser = parse_lba)]
    pub blocks: u64,

    /// Run background zero until the range is written instead of leaving
    /// whole chunks to a later run
    #[arg(long)]
    pub wait: bool,
}

pub async fn execute(args: ZeroArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let home = DriveHome::lock(&global.home_dir())?;
    let drive = home.open().await?;

    let result = async {
        drive
            .submit(ZeroRequest::UserZero {
                lba: args.lba,
                blocks: args.blocks,
            })
            .await?;
        if args.wait {
            run_until_idle(&drive, Engine::BackgroundZero, None).await?;
        }
        anyhow::Ok(())
    }
    .await;
    settle(result, drive.destroy().await)?;

    // The request was accepted, so the range is valid.
    let range = BlockRange::new(args.lba, args.blocks);
    match drive.geometry().split_edges(range).whole {
        Some(span) if !args.wait => println!(
            "Marked {} blocks at lba {:#x} for zeroing ({} whole chunks left to background zero)",
            args.blocks, args.lba, span.count
        ),
        _ => println!("Zeroed {} blocks at lba {:#x}", args.blocks, args.lba),
    }
    Ok(())
}

/// The request's own error wins over a failed teardown.
fn settle(result: anyhow::Result<()>, destroyed: DrivecapResult<()>) -> anyhow::Result<()> {
    result?;
    destroyed?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecap::DrivecapError;

    #[test]
    fn test_settle_prefers_request_error() {
        let err = settle(
            Err(DrivecapError::InvalidRequest("range not aligned".into()).into()),
            Err(DrivecapError::Storage("flush failed".into())),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not aligned"));

        let err = settle(Ok(()), Err(DrivecapError::Storage("flush failed".into()))).unwrap_err();
        assert!(err.to_string().contains("flush failed"));

        assert!(settle(Ok(()), Ok(())).is_ok());
    }
}
