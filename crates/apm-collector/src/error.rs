// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy of the collector.
//!
//! Producer-path errors ([`ReportError`], [`CorrelationError`]) are absorbed by the
//! public entry points and only surface through logs and counters. A correlation miss
//! is not an error at all: matching returns an empty result. [`DeliveryError`] is
//! absorbed at the worker boundary; with the default [`crate::config::RetryStrategy::Drop`]
//! the batch is lost, a gap that retry strategies close at the cost of latency.

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("Source event has no correlation id")]
    MissingId,

    #[error("Source event {0} has no fragment id")]
    MissingFragmentId(String),

    #[error("Correlation index is full ({0} pending records)")]
    CapacityExceeded(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Collector rejected batch with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("Collector did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Failed to serialize batch: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Client errors will fail again no matter how often the batch is resent.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Rejected { status, .. } => status.is_client_error(),
            Self::Serialization(_) => true,
            Self::Transport(_) | Self::Timeout(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("Collector service is not available")]
    ServiceUnavailable,

    #[error("Reporter has been shut down")]
    ShutDown,
}
