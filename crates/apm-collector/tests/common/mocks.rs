// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock collector services

use apm_collector::{buffer::Batch, error::DeliveryError, service::CollectorService};
use apm_model::Fragment;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Forwards every stored batch to a channel.
pub struct RecordingService {
    tx: UnboundedSender<Batch>,
}

impl RecordingService {
    pub fn new() -> (Self, UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl CollectorService for RecordingService {
    async fn store(
        &self,
        tenant_id: Option<&str>,
        fragments: &[Fragment],
    ) -> Result<(), DeliveryError> {
        let _ = self.tx.send(Batch {
            tenant_id: tenant_id.map(str::to_string),
            fragments: fragments.to_vec(),
        });
        Ok(())
    }
}

/// Rejects every batch and remembers the ids it was offered.
#[derive(Default)]
pub struct FailingService {
    pub calls: AtomicUsize,
    pub offered: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl CollectorService for FailingService {
    async fn store(
        &self,
        _tenant_id: Option<&str>,
        fragments: &[Fragment],
    ) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.offered
            .lock()
            .unwrap()
            .extend(fragments.iter().map(|f| f.id.clone()));
        Err(DeliveryError::Rejected {
            status: StatusCode::BAD_GATEWAY,
            body: "collector down".to_string(),
        })
    }
}
