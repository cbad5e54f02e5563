// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction state written by instrumented call sites.
//!
//! Generated instrumentation calls [`StateRegistry::set_state`] with whatever its
//! context and value expressions evaluated to, which may be nothing. Missing input is
//! ignored so instrumentation can never fail the host application.
//!
//! Every context expires once it has not been written for the registry's time-to-live,
//! so state of fragments that never complete and sessions that never end is not kept
//! forever. Expired contexts read as empty and are removed by
//! [`StateRegistry::evict_expired`], which [`StateRegistry::spawn_sweeper`] runs
//! periodically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use apm_model::{Fragment, Property};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type State = BTreeMap<String, String>;

/// Idle time after which a context's state is dropped.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct Scoped {
    values: State,
    expires_at: Instant,
}

impl Scoped {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug)]
pub struct StateRegistry {
    fragments: DashMap<String, Scoped>,
    sessions: DashMap<String, Scoped>,
    ttl: Duration,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_STATE_TTL)
    }
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            fragments: DashMap::new(),
            sessions: DashMap::new(),
            ttl,
        }
    }

    fn scope(&self, session: bool) -> &DashMap<String, Scoped> {
        if session {
            &self.sessions
        } else {
            &self.fragments
        }
    }

    /// Records `name = value` for `context`. Session state outlives the fragment that
    /// set it; fragment state is handed over with the fragment. Each write extends the
    /// context's lifetime by the time-to-live.
    ///
    /// Returns false, changing nothing, when `context` or `value` is `None`.
    pub fn set_state(
        &self,
        context: Option<&str>,
        name: &str,
        value: Option<&str>,
        session: bool,
    ) -> bool {
        self.set_state_at(context, name, value, session, Instant::now())
    }

    fn set_state_at(
        &self,
        context: Option<&str>,
        name: &str,
        value: Option<&str>,
        session: bool,
        now: Instant,
    ) -> bool {
        let (Some(context), Some(value)) = (context, value) else {
            debug!("Ignoring state {name}: context or value is missing");
            return false;
        };
        let mut scoped = self
            .scope(session)
            .entry(context.to_string())
            .or_insert_with(|| Scoped {
                values: State::new(),
                expires_at: now,
            });
        if scoped.is_expired(now) {
            scoped.values.clear();
        }
        scoped.expires_at = now + self.ttl;
        scoped.values.insert(name.to_string(), value.to_string());
        true
    }

    pub fn get_state(&self, context: &str, name: &str, session: bool) -> Option<String> {
        self.get_state_at(context, name, session, Instant::now())
    }

    fn get_state_at(&self, context: &str, name: &str, session: bool, now: Instant) -> Option<String> {
        let scoped = self.scope(session).get(context)?;
        if scoped.is_expired(now) {
            return None;
        }
        scoped.values.get(name).cloned()
    }

    /// Removes and returns the fragment-scoped state of `context`.
    pub fn take_fragment_state(&self, context: &str) -> State {
        Self::take(&self.fragments, context, Instant::now())
    }

    /// Forgets the session-scoped state of `context`, returning it.
    pub fn end_session(&self, context: &str) -> State {
        Self::take(&self.sessions, context, Instant::now())
    }

    fn take(scope: &DashMap<String, Scoped>, context: &str, now: Instant) -> State {
        match scope.remove(context) {
            Some((_, scoped)) if !scoped.is_expired(now) => scoped.values,
            _ => State::new(),
        }
    }

    /// Copies the session state and moves the fragment state of `context` onto
    /// `fragment` as text properties. Returns the number of properties added.
    pub fn attach_to(&self, context: &str, fragment: &mut Fragment) -> usize {
        let now = Instant::now();
        let mut added = 0;
        if let Some(session) = self.sessions.get(context) {
            if !session.is_expired(now) {
                for (name, value) in session.values.iter() {
                    added += usize::from(fragment.properties.insert(Property::text(name, value)));
                }
            }
        }
        for (name, value) in Self::take(&self.fragments, context, now) {
            added += usize::from(fragment.properties.insert(Property::text(name, value)));
        }
        added
    }

    /// Number of live and not yet evicted contexts, fragment and session scope together.
    pub fn len(&self) -> usize {
        self.fragments.len() + self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every context whose time-to-live has run out. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for scope in [&self.fragments, &self.sessions] {
            scope.retain(|_, scoped| {
                let keep = !scoped.is_expired(now);
                evicted += usize::from(!keep);
                keep
            });
        }
        if evicted > 0 {
            warn!("Expired state of {evicted} idle transaction contexts");
        }
        evicted
    }

    /// Runs [`StateRegistry::evict_expired`] every `period` until `cancel` fires. Must
    /// be called from within a tokio runtime.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_expired();
                    }
                }
            }
            debug!("State sweeper stopped");
        })
    }
}
