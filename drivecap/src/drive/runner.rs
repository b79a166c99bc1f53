//! Background engine tasks.
//!
//! One task per engine loops over cycles until cancelled or the drive is
//! dropped. Tasks hold a weak reference so an abandoned drive shuts them
//! down on its own.

use std::sync::Weak;
use std::time::Duration;

use drivecap_shared::constants::scheduling::MAX_BACKGROUND_FAILURES;
use tokio_util::sync::CancellationToken;

use crate::drive::core::DriveInner;
use crate::drive::types::{CycleOutcome, Engine};
use crate::metrics::DriveMetricsStorage;

/// What the loop does after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Run the next cycle right away.
    Continue,
    /// Sleep, waking early if new work is signalled.
    Wait(Duration),
}

pub(crate) async fn run_engine(drive: Weak<DriveInner>, engine: Engine, cancel: CancellationToken) {
    let mut failures = 0u32;
    tracing::debug!(engine = engine.as_str(), "Background engine started");

    while !cancel.is_cancelled() {
        let Some(inner) = drive.upgrade() else {
            break;
        };
        let result = inner.run_cycle(engine).await;
        let next = match result {
            // A finished pass rests before the next one starts.
            Ok(CycleOutcome::Wrapped { .. }) => {
                failures = 0;
                Next::Wait(Duration::from_millis(inner.options.idle_interval_ms))
            }
            Ok(outcome) if outcome.made_progress() => {
                failures = 0;
                Next::Continue
            }
            Ok(CycleOutcome::Idle) => {
                failures = 0;
                Next::Wait(Duration::from_millis(inner.options.idle_interval_ms))
            }
            Ok(outcome) => {
                tracing::trace!(engine = engine.as_str(), ?outcome, "Cycle deferred");
                Next::Wait(inner.admission.backoff())
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_BACKGROUND_FAILURES {
                    tracing::error!(
                        engine = engine.as_str(),
                        failures,
                        error = %e,
                        "Background engine keeps failing"
                    );
                    DriveMetricsStorage::incr(&inner.metrics.escalated_faults);
                    failures = 0;
                } else {
                    tracing::warn!(engine = engine.as_str(), failures, error = %e, "Background cycle failed");
                }
                Next::Wait(inner.admission.backoff())
            }
        };

        let wake = inner.wake(engine);
        drop(inner);

        match next {
            Next::Continue => tokio::task::yield_now().await,
            Next::Wait(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => {}
                }
            }
        }
    }

    tracing::debug!(engine = engine.as_str(), "Background engine stopped");
}
