// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boundary with the backend that stores transaction fragments.

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use apm_model::Fragment;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::DeliveryError;

pub const TENANT_HEADER: &str = "X-Tenant-Id";
const FRAGMENTS_PATH: &str = "/fragments";

/// Backend store for transaction fragments. Batches may arrive in any order.
#[async_trait]
pub trait CollectorService: Send + Sync {
    async fn store(
        &self,
        tenant_id: Option<&str>,
        fragments: &[Fragment],
    ) -> Result<(), DeliveryError>;
}

/// Set-once slot for the collector service.
///
/// Service discovery may finish after producers have started reporting; until then
/// [`ServiceHandle::get`] returns `None` and callers treat the backend as unavailable
/// instead of waiting for it. The first published service wins.
#[derive(Clone, Default)]
pub struct ServiceHandle {
    service: Arc<OnceLock<Arc<dyn CollectorService>>>,
}

impl ServiceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(service: Arc<dyn CollectorService>) -> Self {
        let handle = Self::new();
        handle.set(service);
        handle
    }

    /// Publishes `service`. Returns false if a service was already published.
    pub fn set(&self, service: Arc<dyn CollectorService>) -> bool {
        self.service.set(service).is_ok()
    }

    pub fn get(&self) -> Option<Arc<dyn CollectorService>> {
        self.service.get().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.service.get().is_some()
    }

    /// Spawns `lookup` and publishes its result when it completes.
    pub fn resolve_with<F>(&self, lookup: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<Arc<dyn CollectorService>>> + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            match lookup.await {
                Ok(service) => {
                    if handle.set(service) {
                        info!("Initialised collector service");
                    } else {
                        debug!("Collector service already resolved, ignoring lookup result");
                    }
                }
                Err(e) => error!("Failed to locate collector service: {e:#}"),
            }
        })
    }
}

impl Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceHandle(resolved: {})", self.is_resolved())
    }
}

/// Collector reached over HTTP: each batch is POSTed as a JSON array of fragments to
/// `{base_url}/fragments`, with the tenant in the `X-Tenant-Id` header.
#[derive(Debug, Clone)]
pub struct HttpCollectorService {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpCollectorService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}{FRAGMENTS_PATH}", base_url.trim_end_matches('/')),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CollectorService for HttpCollectorService {
    async fn store(
        &self,
        tenant_id: Option<&str>,
        fragments: &[Fragment],
    ) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(fragments)?;
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(tenant_id) = tenant_id {
            request = request.header(TENANT_HEADER, tenant_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!("Stored {} fragments ({status})", fragments.len());
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status,
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopService;

    #[async_trait]
    impl CollectorService for NoopService {
        async fn store(&self, _: Option<&str>, _: &[Fragment]) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    #[test]
    fn test_first_published_service_wins() {
        let handle = ServiceHandle::new();
        assert!(!handle.is_resolved());
        assert!(handle.get().is_none());

        let first: Arc<dyn CollectorService> = Arc::new(NoopService);
        assert!(handle.set(Arc::clone(&first)));
        assert!(!handle.set(Arc::new(NoopService)));

        let current = handle.get().unwrap();
        assert!(Arc::ptr_eq(&current, &first));
    }

    #[test]
    fn test_clones_observe_publication() {
        let handle = ServiceHandle::new();
        let clone = handle.clone();
        handle.set(Arc::new(NoopService));
        assert!(clone.is_resolved());
    }

    #[tokio::test]
    async fn test_resolve_with_publishes_lookup_result() {
        let handle = ServiceHandle::new();
        handle
            .resolve_with(async { Ok(Arc::new(NoopService) as Arc<dyn CollectorService>) })
            .await
            .unwrap();
        assert!(handle.is_resolved());
    }

    #[tokio::test]
    async fn test_failed_lookup_leaves_handle_unresolved() {
        let handle = ServiceHandle::new();
        handle
            .resolve_with(async { Err(anyhow::anyhow!("no collector registered")) })
            .await
            .unwrap();
        assert!(!handle.is_resolved());
    }

    #[test]
    fn test_url_is_normalized() {
        let service = HttpCollectorService::new("http://collector:8080/", Duration::from_secs(1))
            .unwrap();
        assert_eq!(service.url(), "http://collector:8080/fragments");
    }
}
