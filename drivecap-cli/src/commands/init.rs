use clap::Args;
use drivecap::DriveOptions;
use drivecap_shared::constants::chunk as const_chunk;

use crate::home::DriveHome;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Exported capacity in chunks
    #[arg(long)]
    pub chunks: u64,

    /// Blocks per chunk
    #[arg(long, default_value_t = const_chunk::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Chunk records per metadata page
    #[arg(long, default_value_t = const_chunk::DEFAULT_RECORDS_PER_PAGE)]
    pub records_per_page: u64,

    /// Name carried by log lines
    #[arg(long, default_value = "drive")]
    pub name: String,

    /// Zero by deallocating blocks instead of writing them
    #[arg(long)]
    pub deallocate: bool,

    /// Replace an existing drive
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: InitArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    if args.chunks == 0 {
        anyhow::bail!("--chunks must be at least 1");
    }
    let capacity_blocks = args.chunks.checked_mul(args.chunk_size).ok_or_else(|| {
        anyhow::anyhow!("{} chunks of {} blocks overflow", args.chunks, args.chunk_size)
    })?;

    let home = DriveHome::lock(&global.home_dir())?;
    if home.has_drive() && !args.force {
        anyhow::bail!(
            "a drive already exists at {}; use --force to replace it",
            home.options_path().display()
        );
    }

    let mut options = DriveOptions::with_chunks(args.chunks);
    options.name = args.name;
    options.chunk_size = args.chunk_size;
    options.capacity_blocks = capacity_blocks;
    options.records_per_page = args.records_per_page;
    options.capabilities.deallocate_on_zero = args.deallocate;

    let drive = home.create(&options).await?;
    drive.destroy().await?;

    println!(
        "Created drive '{}': {} chunks of {} blocks",
        options.name, args.chunks, options.chunk_size
    );
    Ok(())
}
