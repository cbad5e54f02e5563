// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use apm_model::Fragment;

/// Fragments flushed together under one tenant. Owned by whoever drained it; the buffer
/// keeps no reference to a batch once it is handed out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub tenant_id: Option<String>,
    pub fragments: Vec<Fragment>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragment_ids(&self) -> Vec<&str> {
        self.fragments.iter().map(|f| f.id.as_str()).collect()
    }
}

/// Accumulates completed fragments until they are drained into a [`Batch`].
///
/// A single mutex guards the active sequence. Draining swaps it for an empty one, so
/// a fragment is either in the drained batch or in the buffer, never both.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    tenant_id: Option<String>,
    active: Mutex<Vec<Fragment>>,
}

/// Exclusive access to the buffer, for callers that must add and drain in one critical
/// section.
pub struct BufferGuard<'a> {
    tenant_id: &'a Option<String>,
    active: MutexGuard<'a, Vec<Fragment>>,
}

impl FragmentBuffer {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn lock(&self) -> BufferGuard<'_> {
        // A producer that panicked mid-push leaves a valid Vec behind.
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        BufferGuard {
            tenant_id: &self.tenant_id,
            active,
        }
    }

    /// Appends `fragment`, returning the number of buffered fragments after the insert.
    pub fn add(&self, fragment: Fragment) -> usize {
        self.lock().add(fragment)
    }

    pub fn drain_all(&self) -> Batch {
        self.lock().drain_all()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BufferGuard<'_> {
    pub fn add(&mut self, fragment: Fragment) -> usize {
        self.active.push(fragment);
        self.active.len()
    }

    /// Swaps the active sequence for an empty one and returns the old one as a batch.
    pub fn drain_all(&mut self) -> Batch {
        Batch {
            tenant_id: self.tenant_id.clone(),
            fragments: mem::take(&mut *self.active),
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
