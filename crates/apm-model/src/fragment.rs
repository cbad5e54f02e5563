// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::property::Property;
use crate::source_info::SourceInfo;

/// How a consumer fragment relates to the producer it was correlated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CorrelationScope {
    /// Point-to-point hand-off: the producer caused exactly this consumer.
    CausedBy,
    /// One of several consumers of a fanned-out producer event.
    Interaction,
}

/// Join between a consumer fragment and the producer event it was matched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationLink {
    pub id: String,
    pub scope: CorrelationScope,
    pub source_fragment_id: String,
    pub source_host: Option<String>,
    /// Producer start time, epoch milliseconds.
    pub source_timestamp: u64,
}

impl CorrelationLink {
    pub fn from_source(source: &SourceInfo) -> Self {
        let scope = if source.multiple_consumers {
            CorrelationScope::Interaction
        } else {
            CorrelationScope::CausedBy
        };
        Self {
            id: source.id.clone(),
            scope,
            source_fragment_id: source.fragment_id.clone(),
            source_host: source.host_name.clone(),
            source_timestamp: source.timestamp,
        }
    }
}

/// A locally observed slice of a distributed transaction.
///
/// The reporter treats fragments as opaque units: they are batched in report order and
/// handed to the collector service as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: String,
    /// Business transaction name, once known.
    pub transaction: Option<String>,
    pub timestamp: u64,
    pub duration: u64,
    pub host_name: Option<String>,
    pub host_address: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub properties: BTreeSet<Property>,
    /// Producer events captured while this fragment was active.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<CorrelationLink>,
}

impl Fragment {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = Some(transaction.into());
        self
    }

    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.insert(property);
        self
    }

    /// Whether this fragment was joined to the producer with correlation `id`.
    pub fn is_linked_to(&self, id: &str) -> bool {
        self.links.iter().any(|link| link.id == id)
    }
}
