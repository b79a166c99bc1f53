use clap::Args;
use drivecap::ZeroRequest;

use crate::cli::parse_lba;
use crate::home::DriveHome;

#[derive(Args, Debug)]
pub struct VerifyInvalidateArgs {
    /// Any block covered by the suspect metadata page
    #[arg(value_parser = parse_lba, default_value = "0")]
    pub lba: u64,
}

pub async fn execute(
    args: VerifyInvalidateArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let home = DriveHome::lock(&global.home_dir())?;
    let drive = home.open().await?;
    let result = drive
        .submit(ZeroRequest::VerifyInvalidate { lba: args.lba })
        .await;
    let checkpoint = drive.checkpoints().await.verify_invalidate_checkpoint;
    drive.destroy().await?;
    result?;

    println!("Verify-invalidate scheduled from lba {:#x}", checkpoint);
    Ok(())
}
