// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous delivery of batches to the collector service.
//!
//! [`DeliveryExecutor::submit`] only enqueues; a dispatcher task hands queued batches
//! to at most `batch_threads` concurrent deliveries. Batches leave the queue in flush
//! order but may complete out of order.
//!
//! A batch the collector does not accept is retried according to the configured
//! [`RetryStrategy`]. Once retries are exhausted (immediately, with the default
//! [`RetryStrategy::Drop`]) the batch is logged in full and dropped: delivery is
//! best-effort, at most once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn, Instrument};

use crate::buffer::Batch;
use crate::config::{ReporterConfig, RetryStrategy};
use crate::error::DeliveryError;
use crate::service::ServiceHandle;

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    fragments_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Batches accepted by [`DeliveryExecutor::submit`].
    pub submitted: u64,
    pub delivered: u64,
    /// Batches given up on.
    pub failed: u64,
    /// Individual resend attempts.
    pub retried: u64,
    /// Fragments lost with failed or refused batches.
    pub fragments_dropped: u64,
}

struct Delivery {
    service: ServiceHandle,
    timeout: Duration,
    retry_strategy: RetryStrategy,
    counters: Counters,
}

impl Delivery {
    async fn deliver(&self, batch: Batch) {
        let Some(service) = self.service.get() else {
            self.give_up(&batch, &"collector service is not available");
            return;
        };

        let retries = self.retry_strategy.retries();
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                self.timeout,
                service.store(batch.tenant_id.as_deref(), &batch.fragments),
            )
            .await
            .unwrap_or(Err(DeliveryError::Timeout(self.timeout)));

            match result {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!("Successfully delivered batch of {} fragments", batch.len());
                    return;
                }
                Err(e) if attempt < retries && !e.is_permanent() => {
                    attempt += 1;
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Failed to store batch of {} fragments, retry {attempt}/{retries}: {e}",
                        batch.len()
                    );
                    let backoff = self.retry_strategy.backoff(attempt);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => {
                    self.give_up(&batch, &e);
                    return;
                }
            }
        }
    }

    fn give_up(&self, batch: &Batch, reason: &dyn std::fmt::Display) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .fragments_dropped
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let payload = serde_json::to_string(&batch.fragments)
            .unwrap_or_else(|e| format!("<unserializable batch: {e}>"));
        error!(
            "Failed to store batch of {} fragments for tenant {:?}, dropping it: {reason}. Fragment ids: {:?}. Payload: {payload}",
            batch.len(),
            batch.tenant_id,
            batch.fragment_ids(),
        );
    }
}

/// Bounded pool of batch deliveries.
pub struct DeliveryExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<Batch>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    delivery: Arc<Delivery>,
}

impl DeliveryExecutor {
    /// Starts the dispatcher. Must be called from within a tokio runtime.
    pub fn start(service: ServiceHandle, config: &ReporterConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = Arc::new(Delivery {
            service,
            timeout: config.delivery_timeout,
            retry_strategy: config.retry_strategy,
            counters: Counters::default(),
        });
        let dispatcher = tokio::spawn(
            dispatch(rx, Arc::clone(&delivery), config.batch_threads).in_current_span(),
        );

        Self {
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            delivery,
        }
    }

    /// Queues `batch` for delivery without waiting for it. Returns false if the executor
    /// has been shut down, in which case the batch is dropped.
    pub fn submit(&self, batch: Batch) -> bool {
        if batch.is_empty() {
            return true;
        }
        let counters = &self.delivery.counters;
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let rejected = match tx.as_ref() {
            Some(tx) => match tx.send(batch) {
                Ok(()) => {
                    counters.submitted.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(mpsc::error::SendError(batch)) => batch,
            },
            None => batch,
        };
        drop(tx);

        warn!(
            "Delivery executor is stopped, dropping batch of {} fragments",
            rejected.len()
        );
        counters.failed.fetch_add(1, Ordering::Relaxed);
        counters
            .fragments_dropped
            .fetch_add(rejected.len() as u64, Ordering::Relaxed);
        false
    }

    /// Stops accepting batches and waits up to `timeout` for queued and in-flight
    /// deliveries. Returns false if they were abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        drop(
            self.tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut dispatcher) = dispatcher else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut dispatcher).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Delivery dispatcher failed: {e}");
                false
            }
            Err(_) => {
                warn!("Timed out after {timeout:?} waiting for batch deliveries, abandoning them");
                dispatcher.abort();
                false
            }
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        let counters = &self.delivery.counters;
        DeliveryStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            fragments_dropped: counters.fragments_dropped.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Batch>, delivery: Arc<Delivery>, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut in_flight = JoinSet::new();

    while let Some(batch) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let delivery = Arc::clone(&delivery);
        in_flight.spawn(
            async move {
                delivery.deliver(batch).await;
                drop(permit);
            }
            .in_current_span(),
        );
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    debug!("Delivery executor stopped");
}
