use std::time::Duration;

use clap::{Args, ValueEnum};
use drivecap::{CycleOutcome, Drive, Engine};

use crate::home::DriveHome;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EngineArg {
    All,
    Zero,
    Sniff,
    VerifyInvalidate,
}

impl EngineArg {
    fn engines(self) -> Vec<Engine> {
        match self {
            EngineArg::All => Engine::ALL.to_vec(),
            EngineArg::Zero => vec![Engine::BackgroundZero],
            EngineArg::Sniff => vec![Engine::Sniff],
            EngineArg::VerifyInvalidate => vec![Engine::VerifyInvalidate],
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Engine to run to completion
    #[arg(long, value_enum, default_value_t = EngineArg::All)]
    pub engine: EngineArg,

    /// Stop each engine after this many cycles
    #[arg(long)]
    pub max_cycles: Option<u64>,

    /// Start the background engines and let them run for this long
    #[arg(long, value_name = "SECONDS", conflicts_with = "max_cycles")]
    pub background: Option<u64>,

    /// Print each cycle outcome as a JSON line
    #[arg(long)]
    pub json: bool,
}

/// Run cycles of `engine` until it stops making progress, a sniff pass
/// wraps, or `max_cycles` is reached.
pub async fn run_until_idle(
    drive: &Drive,
    engine: Engine,
    max_cycles: Option<u64>,
) -> anyhow::Result<Vec<CycleOutcome>> {
    let mut outcomes = Vec::new();
    loop {
        let outcome = drive.run_cycle(engine).await?;
        outcomes.push(outcome);
        if !outcome.made_progress() || matches!(outcome, CycleOutcome::Wrapped { .. }) {
            break;
        }
        if max_cycles.is_some_and(|max| outcomes.len() as u64 >= max) {
            break;
        }
    }
    Ok(outcomes)
}

fn describe(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::Completed { from, to, .. } => format!("completed {:#x}..{:#x}", from, to),
        CycleOutcome::Skipped { from, to, .. } => format!("skipped {:#x}..{:#x}", from, to),
        CycleOutcome::Wrapped { pass_count } => format!("pass {} complete", pass_count),
        CycleOutcome::Idle => "idle".to_string(),
        CycleOutcome::Deferred { reason } => format!("deferred ({:?})", reason),
    }
}

pub async fn execute(args: RunArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let home = DriveHome::lock(&global.home_dir())?;
    let drive = home.open().await?;

    let result = match args.background {
        Some(seconds) => run_background(&drive, Duration::from_secs(seconds)).await,
        None => run_foreground(&drive, &args).await,
    };
    drive.destroy().await?;
    result?;

    if args.background.is_some() {
        let metrics = drive.metrics();
        println!(
            "zero_ios={} sniff_verifies={} chunks_invalidated={} media_errors={}",
            metrics.zero_ios,
            metrics.sniff_verifies,
            metrics.chunks_invalidated,
            metrics.media_errors
        );
    }
    Ok(())
}

async fn run_foreground(drive: &Drive, args: &RunArgs) -> anyhow::Result<()> {
    for engine in args.engine.engines() {
        let outcomes = run_until_idle(drive, engine, args.max_cycles).await?;
        if args.json {
            for outcome in &outcomes {
                let line = serde_json::json!({
                    "engine": engine,
                    "result": outcome,
                });
                println!("{}", line);
            }
            continue;
        }

        let advanced = outcomes.iter().filter(|o| o.made_progress()).count();
        let last = outcomes
            .last()
            .map(describe)
            .unwrap_or_else(|| "no cycles".to_string());
        println!(
            "{}: {} cycles, {} advanced, last {}",
            engine.as_str(),
            outcomes.len(),
            advanced,
            last
        );
    }
    Ok(())
}

async fn run_background(drive: &Drive, duration: Duration) -> anyhow::Result<()> {
    drive.start_background()?;
    tracing::info!(seconds = duration.as_secs(), "Background engines started");

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping background engines");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecap::DeferReason;
    use drivecap::checkpoint::Cursor;

    #[test]
    fn test_engine_selection() {
        assert_eq!(EngineArg::All.engines().len(), 3);
        assert_eq!(EngineArg::All.engines()[0], Engine::VerifyInvalidate);
        assert_eq!(EngineArg::Zero.engines(), vec![Engine::BackgroundZero]);
    }

    #[test]
    fn test_describe() {
        let completed = CycleOutcome::Completed {
            cursor: Cursor::Zero,
            from: 0,
            to: 0x800,
        };
        assert_eq!(describe(&completed), "completed 0x0..0x800");
        assert_eq!(
            describe(&CycleOutcome::Wrapped { pass_count: 2 }),
            "pass 2 complete"
        );
        assert_eq!(
            describe(&CycleOutcome::Deferred {
                reason: DeferReason::Admission
            }),
            "deferred (Admission)"
        );
    }
}
