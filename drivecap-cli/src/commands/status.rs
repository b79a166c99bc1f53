use clap::{Args, ValueEnum};
use comfy_table::Table;
use comfy_table::presets::NOTHING;
use drivecap::DriveSnapshot;
use drivecap_shared::constants::lba::INVALID as LBA_INVALID;

use crate::home::DriveHome;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

pub async fn execute(args: StatusArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let home = DriveHome::lock(&global.home_dir())?;
    let drive = home.open().await?;
    let snapshot = drive.inspect().await;
    drive.destroy().await?;
    let snapshot = snapshot?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Table => println!("{}", render(&snapshot)),
    }
    Ok(())
}

fn lba_or(lba: u64, none: &str) -> String {
    if lba == LBA_INVALID {
        none.to_string()
    } else {
        format!("{:#x}", lba)
    }
}

fn render(snapshot: &DriveSnapshot) -> Table {
    let state = &snapshot.state;
    let report = &state.report;
    let flags = if snapshot.flags.is_empty() {
        "-".to_string()
    } else {
        snapshot.flags.join(",")
    };
    let last_pass = report
        .last_pass_completed_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    let mut table = Table::new();
    table.load_preset(NOTHING);
    let rows = [
        ("Name", snapshot.name.clone()),
        ("Status", snapshot.status.as_str().to_string()),
        ("Capacity", format!("{} blocks", snapshot.capacity_blocks)),
        ("Chunk size", format!("{} blocks", snapshot.chunk_size)),
        ("Chunks", snapshot.chunks.total.to_string()),
        ("Needs zero", snapshot.chunks.needs_zero.to_string()),
        ("Invalid", snapshot.chunks.invalid.to_string()),
        ("Consumed", snapshot.chunks.consumed.to_string()),
        ("Unreadable pages", snapshot.chunks.unreadable_pages.to_string()),
        ("Zero checkpoint", format!("{:#x}", state.zero_checkpoint)),
        ("Sniff checkpoint", format!("{:#x}", state.sniff_checkpoint)),
        (
            "Verify-invalidate",
            lba_or(state.verify_invalidate_checkpoint, "idle"),
        ),
        ("Media error lba", lba_or(state.media_error_lba, "-")),
        ("Flags", flags),
        ("Sniff passes", report.pass_count.to_string()),
        ("Last pass", last_pass),
        (
            "Errors (last pass)",
            format!(
                "{} recoverable, {} unrecoverable",
                report.previous.recoverable, report.previous.unrecoverable
            ),
        ),
        (
            "Errors (total)",
            format!(
                "{} recoverable, {} unrecoverable",
                report.totals.recoverable, report.totals.unrecoverable
            ),
        ),
    ];
    for (field, value) in rows {
        table.add_row(vec![format!("{}:", field), value]);
    }
    table
}
