// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use apm_collector::buffer::Batch;
use apm_collector::config::ReporterConfig;
use apm_model::{EndpointRef, Fragment, Property, SourceInfo};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

pub fn test_config(batch_size: usize) -> ReporterConfig {
    ReporterConfig {
        batch_size,
        tenant_id: Some("test-tenant".to_string()),
        ..ReporterConfig::default()
    }
}

/// A producer-side event as recorded by an outbound HTTP call.
pub fn outbound_call(id: &str, fragment_id: &str) -> SourceInfo {
    SourceInfo::new(id, fragment_id)
        .with_endpoint(EndpointRef::outbound("http://inventory/items"))
        .with_timestamp(1_700_000_000_000)
        .with_host("web-1", "10.0.0.1")
        .with_property(Property::text("http.method", "GET"))
}

pub fn fragments(prefix: &str, count: usize) -> Vec<Fragment> {
    (0..count)
        .map(|i| Fragment::new(format!("{prefix}-{i}")))
        .collect()
}

/// Collects batches until `fragments` fragments have arrived.
pub async fn receive_fragments(rx: &mut UnboundedReceiver<Batch>, fragments: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut received = 0;
    while received < fragments {
        let batch = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a batch")
            .expect("collector channel closed");
        received += batch.len();
        batches.push(batch);
    }
    batches
}
