use clap::Args;
use drivecap::ZeroRequest;

use crate::home::DriveHome;

#[derive(Args, Debug)]
pub struct ScrubArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

pub async fn execute(args: ScrubArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    if !args.yes {
        eprint!("Every chunk will be zeroed again. Continue? [y/N] ");
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted");
            return Ok(());
        }
    }

    let home = DriveHome::lock(&global.home_dir())?;
    let drive = home.open().await?;
    let result = drive.submit(ZeroRequest::MarkDiskZero).await;
    drive.destroy().await?;
    result?;

    println!("Drive marked for zeroing");
    Ok(())
}
