// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Periodic flush timer, independent of producer activity.
///
/// The first tick fires one full period after [`BatchScheduler::spawn`]. A tick that
/// falls behind is delayed, not replayed, so a stalled runtime never produces a burst
/// of back-to-back flushes.
#[derive(Debug)]
pub struct BatchScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BatchScheduler {
    /// Calls `flush` every `period` until the scheduler is stopped or `cancel` fires.
    /// `flush` reports whether it found anything to drain. Must be called from within a
    /// tokio runtime.
    pub fn spawn<F>(period: Duration, cancel: CancellationToken, flush: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if flush() {
                            debug!("Flushed buffered fragments on timer");
                        }
                    }
                    () = token.cancelled() => {
                        debug!("Batch scheduler stopped");
                        break;
                    }
                }
            }
        });

        Self { cancel, task }
    }

    /// Cancels the timer and waits for an in-progress tick to finish. Returns false if
    /// the timer task panicked.
    pub async fn stop(self) -> bool {
        self.cancel.cancel();
        match self.task.await {
            Ok(()) => true,
            Err(e) => {
                error!("Batch scheduler failed: {e}");
                false
            }
        }
    }
}
