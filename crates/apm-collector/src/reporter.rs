// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for completed fragments.
//!
//! [`Reporter::report`] is called from instrumented application threads. It never
//! blocks on the collector: at worst it waits for the buffer mutex, which is only held
//! to append a fragment or to swap the buffered fragments out. A batch is drained when
//! the buffer reaches `batch_size`, on every `batch_time` tick, and once more on
//! shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use apm_model::Fragment;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferGuard, FragmentBuffer};
use crate::config::ReporterConfig;
use crate::error::{ConfigError, ReportError};
use crate::executor::{DeliveryExecutor, DeliveryStats};
use crate::scheduler::BatchScheduler;
use crate::service::ServiceHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    /// Fragments accepted into the buffer.
    pub reported: u64,
    /// Fragments refused because the collector service was not resolved yet.
    pub dropped_unavailable: u64,
    /// Fragments refused after shutdown.
    pub dropped_shutdown: u64,
    /// Fragments waiting for the next flush.
    pub buffered: usize,
    pub delivery: DeliveryStats,
}

struct Shared {
    config: ReporterConfig,
    service: ServiceHandle,
    buffer: FragmentBuffer,
    executor: DeliveryExecutor,
    shut_down: AtomicBool,
    reported: AtomicU64,
    dropped_unavailable: AtomicU64,
    dropped_shutdown: AtomicU64,
}

impl Shared {
    /// Drains the buffer and submits the batch without releasing the lock, so batches
    /// reach the executor in the order they were drained.
    fn submit_drained(&self, guard: &mut BufferGuard<'_>) {
        let batch = guard.drain_all();
        debug!("Submitting batch of {} fragments", batch.len());
        self.executor.submit(batch);
    }

    fn flush(&self) -> bool {
        let mut guard = self.buffer.lock();
        if guard.is_empty() {
            return false;
        }
        self.submit_drained(&mut guard);
        true
    }
}

/// Batching reporter.
pub struct Reporter {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<BatchScheduler>>,
    cancel: CancellationToken,
}

impl Reporter {
    /// Starts the flush timer and the delivery executor. Must be called from within a
    /// tokio runtime.
    ///
    /// `service` may still be unresolved; fragments reported before it resolves are
    /// dropped.
    pub fn start(config: ReporterConfig, service: ServiceHandle) -> Self {
        let executor = DeliveryExecutor::start(service.clone(), &config);
        let shared = Arc::new(Shared {
            buffer: FragmentBuffer::new(config.tenant_id.clone()),
            executor,
            service,
            shut_down: AtomicBool::new(false),
            reported: AtomicU64::new(0),
            dropped_unavailable: AtomicU64::new(0),
            dropped_shutdown: AtomicU64::new(0),
            config,
        });

        let cancel = CancellationToken::new();
        let scheduler = {
            let shared = Arc::clone(&shared);
            BatchScheduler::spawn(shared.config.batch_time, cancel.child_token(), move || {
                shared.flush()
            })
        };

        info!(
            "Started reporter: batch size {}, batch time {:?}, {} delivery workers, tenant {:?}",
            shared.config.batch_size,
            shared.config.batch_time,
            shared.config.batch_threads,
            shared.config.tenant_id,
        );

        Self {
            shared,
            scheduler: Mutex::new(Some(scheduler)),
            cancel,
        }
    }

    /// Reads the configuration from `APM_*` environment variables and starts.
    pub fn from_env(service: ServiceHandle) -> Result<Self, ConfigError> {
        Ok(Self::start(ReporterConfig::from_env()?, service))
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.shared.config
    }

    /// Buffers `fragment` for delivery. Never fails: a fragment that cannot be accepted
    /// is dropped and counted.
    pub fn report(&self, fragment: Fragment) {
        let _ = self.try_report(fragment);
    }

    /// Buffers `fragment`, flushing the buffer when it reaches the batch size.
    ///
    /// Fails fast with [`ReportError::ServiceUnavailable`] while the collector service
    /// is unresolved; the fragment is dropped rather than queued.
    pub fn try_report(&self, fragment: Fragment) -> Result<(), ReportError> {
        let shared = &self.shared;
        if !shared.service.is_resolved() {
            let dropped = shared.dropped_unavailable.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 {
                warn!(
                    "Collector service is not available yet, dropping fragment {}",
                    fragment.id
                );
            } else {
                debug!(
                    "Collector service is not available yet, dropping fragment {} ({dropped} dropped so far)",
                    fragment.id
                );
            }
            return Err(ReportError::ServiceUnavailable);
        }

        let mut guard = shared.buffer.lock();
        // Checked under the lock so nothing lands in the buffer after the final drain.
        if shared.shut_down.load(Ordering::Acquire) {
            drop(guard);
            shared.dropped_shutdown.fetch_add(1, Ordering::Relaxed);
            debug!("Reporter is shut down, dropping fragment {}", fragment.id);
            return Err(ReportError::ShutDown);
        }
        if guard.add(fragment) >= shared.config.batch_size {
            shared.submit_drained(&mut guard);
        }
        drop(guard);

        shared.reported.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Submits whatever is buffered. Returns false if the buffer was empty.
    pub fn flush(&self) -> bool {
        self.shared.flush()
    }

    /// Drains the buffer one last time, stops the flush timer and waits up to `timeout`
    /// for queued and in-flight deliveries. Fragments reported afterwards are refused.
    ///
    /// Returns false if deliveries were still running when the wait ran out.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut guard = self.shared.buffer.lock();
            self.shared.shut_down.store(true, Ordering::Release);
            if !guard.is_empty() {
                info!("Flushing {} buffered fragments before shutdown", guard.len());
                self.shared.submit_drained(&mut guard);
            }
        }

        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        let completed = self.shared.executor.shutdown(timeout).await;
        info!("Reporter shut down");
        completed
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReporterStats {
        let shared = &self.shared;
        ReporterStats {
            reported: shared.reported.load(Ordering::Relaxed),
            dropped_unavailable: shared.dropped_unavailable.load(Ordering::Relaxed),
            dropped_shutdown: shared.dropped_shutdown.load(Ordering::Relaxed),
            buffered: shared.buffer.len(),
            delivery: shared.executor.stats(),
        }
    }
}

impl Drop for Reporter {
    /// Stops the timer and hands anything still buffered to the executor, which keeps
    /// delivering its queue after the reporter is gone.
    fn drop(&mut self) {
        self.cancel.cancel();
        let mut guard = self.shared.buffer.lock();
        if !guard.is_empty() {
            warn!(
                "Reporter dropped without shutdown, submitting {} buffered fragments",
                guard.len()
            );
            self.shared.submit_drained(&mut guard);
        }
    }
}
