//! Background calibration scheduler.
//!
//! Runs an `Interval` cycle every `calibration.interval_secs` until told to
//! stop. A zero interval disables the scheduler.

use std::sync::Arc;
use std::time::Duration;

use mood_calibration::{CycleOutcome, CycleTrigger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::MoodEngine;

pub struct CalibrationScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CalibrationScheduler {
    /// Spawn the loop, or `None` when the configured interval is zero.
    pub fn spawn(engine: Arc<MoodEngine>) -> Option<Self> {
        let secs = engine.config().calibration.interval_secs;
        if secs == 0 {
            tracing::info!("Calibration scheduler disabled");
            return None;
        }
        Some(Self::spawn_every(engine, Duration::from_secs(secs)))
    }

    pub fn spawn_every(engine: Arc<MoodEngine>, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; skip it so a fresh start
            // waits one full period.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match engine.run_calibration_cycle(CycleTrigger::Interval).await {
                            Ok(report) => match report.outcome {
                                CycleOutcome::InsufficientSamples { .. } => {
                                    tracing::debug!("Scheduled calibration skipped: {:?}", report.outcome);
                                }
                                ref outcome => {
                                    tracing::info!(cycle = %report.cycle_id, "Scheduled calibration: {:?}", outcome);
                                }
                            },
                            Err(e) => tracing::warn!("Scheduled calibration failed: {:#}", e),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("Calibration scheduler stopped");
                            return;
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the loop and wait for it to finish its current cycle.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!("Calibration scheduler task ended abnormally: {}", e);
        }
    }
}
