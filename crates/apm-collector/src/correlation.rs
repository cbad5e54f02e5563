// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlation of producer events with their consumers.
//!
//! Producers register a [`SourceInfo`] under its correlation id; consumers that read the
//! same id (from a message header, a propagated request header, ...) match against the
//! index to find the fragment they continue.
//!
//! # Matching cardinality
//!
//! - Single-consumer records are removed by the match that returns them. Concurrent
//!   matches on the same id serialize on the index shard, so exactly one of them gets
//!   the record and the others observe a miss.
//! - Records flagged `multiple_consumers` are returned to every match and stay in the
//!   index until [`CorrelationEngine::retire`] is called or their time-to-live runs out.
//!
//! A miss is a normal outcome (the consumer is an origin point, or the single consumer
//! slot was already taken) and is reported as an empty result.
//!
//! # Expiry
//!
//! Every record carries a deadline of `now + ttl`. Expired records are dropped lazily
//! when their id is matched and eagerly by [`CorrelationEngine::evict_expired`], which
//! [`CorrelationEngine::spawn_sweeper`] runs periodically. Both paths count the loss in
//! [`CorrelationStats::expired`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use apm_model::{CorrelationLink, Fragment, SourceInfo};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CorrelationConfig;
use crate::error::CorrelationError;

struct Pending {
    source: SourceInfo,
    expires_at: Instant,
}

impl Pending {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    matched: AtomicU64,
    misses: AtomicU64,
    retired: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time view of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub registered: u64,
    /// Source records handed to consumers (a fan-out record counts once per match).
    pub matched: u64,
    /// Matches that found nothing.
    pub misses: u64,
    pub retired: u64,
    pub expired: u64,
    /// Registrations refused because the index was full.
    pub rejected: u64,
    pub pending: usize,
}

pub struct CorrelationEngine {
    index: DashMap<String, Vec<Pending>>,
    pending: AtomicUsize,
    config: CorrelationConfig,
    counters: Counters,
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(CorrelationConfig::default())
    }
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            index: DashMap::new(),
            pending: AtomicUsize::new(0),
            config,
            counters: Counters::default(),
        }
    }

    /// Publishes a producer event for correlation.
    ///
    /// When the index is full, expired records are evicted before the registration
    /// is refused.
    pub fn register(&self, source: SourceInfo) -> Result<(), CorrelationError> {
        self.register_at(source, Instant::now())
    }

    fn register_at(&self, source: SourceInfo, now: Instant) -> Result<(), CorrelationError> {
        if source.id.is_empty() {
            return Err(CorrelationError::MissingId);
        }
        if source.fragment_id.is_empty() {
            return Err(CorrelationError::MissingFragmentId(source.id));
        }

        let max_pending = self.config.max_pending;
        // Expired records hold their slot until something evicts them.
        let reserved = self.reserve(max_pending)
            || (self.evict_expired_at(now) > 0 && self.reserve(max_pending));
        if !reserved {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Correlation index is full, dropping source {} of fragment {}",
                source.id, source.fragment_id
            );
            return Err(CorrelationError::CapacityExceeded(max_pending));
        }

        let pending = Pending {
            expires_at: now + self.config.ttl,
            source,
        };
        debug!(
            "Registered source {} of fragment {}",
            pending.source.id, pending.source.fragment_id
        );
        self.index
            .entry(pending.source.id.clone())
            .or_default()
            .push(pending);
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the source records a consumer with `id` continues. Empty on a miss.
    pub fn match_id(&self, id: &str) -> Vec<SourceInfo> {
        self.match_at(id, Instant::now())
    }

    fn match_at(&self, id: &str, now: Instant) -> Vec<SourceInfo> {
        let mut matched = Vec::new();
        let mut removed = 0;
        let mut expired = 0;

        let drained = match self.index.get_mut(id) {
            None => false,
            Some(mut records) => {
                let mut single_taken = false;
                let mut position = 0;
                while position < records.len() {
                    let pending = &records[position];
                    if pending.is_expired(now) {
                        records.remove(position);
                        expired += 1;
                        continue;
                    }
                    if pending.source.multiple_consumers {
                        matched.push(pending.source.clone());
                    } else if !single_taken {
                        single_taken = true;
                        matched.push(records.remove(position).source);
                        removed += 1;
                        continue;
                    }
                    position += 1;
                }
                records.is_empty()
            }
        };

        // The shard guard is released above; only drop the key if no producer refilled it
        // in the meantime.
        if drained {
            self.index.remove_if(id, |_, records| records.is_empty());
        }

        self.release(removed + expired);
        if expired > 0 {
            self.record_expired(expired);
        }

        if matched.is_empty() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("No pending source for correlation id {id}");
        } else {
            self.counters
                .matched
                .fetch_add(matched.len() as u64, Ordering::Relaxed);
        }
        matched
    }

    /// Matches `correlation_id` and records a link to every producer found on `consumer`.
    /// Returns the number of links added.
    pub fn link(&self, consumer: &mut Fragment, correlation_id: &str) -> usize {
        let sources = self.match_id(correlation_id);
        consumer
            .links
            .extend(sources.iter().map(CorrelationLink::from_source));
        sources.len()
    }

    /// Removes a pending record explicitly, typically a fan-out record once its
    /// producer knows no more consumers will arrive. Returns false if the record was
    /// already matched, retired or expired.
    pub fn retire(&self, source: &SourceInfo) -> bool {
        let (retired, drained) = match self.index.get_mut(&source.id) {
            None => (false, false),
            Some(mut records) => {
                match records
                    .iter()
                    .position(|pending| pending.source.fragment_id == source.fragment_id)
                {
                    Some(position) => {
                        records.remove(position);
                        (true, records.is_empty())
                    }
                    None => (false, false),
                }
            }
        };

        if drained {
            self.index.remove_if(&source.id, |_, records| records.is_empty());
        }
        if retired {
            self.release(1);
            self.counters.retired.fetch_add(1, Ordering::Relaxed);
        }
        retired
    }

    /// Finalizes the duration of a pending source once its producing span completes.
    pub fn complete(&self, id: &str, fragment_id: &str, duration: u64) -> bool {
        match self.index.get_mut(id) {
            None => false,
            Some(mut records) => match records
                .iter_mut()
                .find(|pending| pending.source.fragment_id == fragment_id)
            {
                Some(pending) => {
                    pending.source.duration = duration;
                    true
                }
                None => false,
            },
        }
    }

    /// Drops every record whose time-to-live has run out. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut evicted = 0;
        self.index.retain(|_, records| {
            let before = records.len();
            records.retain(|pending| !pending.is_expired(now));
            evicted += before - records.len();
            !records.is_empty()
        });

        if evicted > 0 {
            self.release(evicted);
            self.record_expired(evicted);
        }
        evicted
    }

    /// Runs [`CorrelationEngine::evict_expired`] every `sweep_interval` until `cancel`
    /// fires. Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = engine.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.evict_expired();
                    }
                }
            }
            debug!("Correlation sweeper stopped");
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            matched: self.counters.matched.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Claims one pending slot, failing if `max_pending` are already taken.
    fn reserve(&self, max_pending: usize) -> bool {
        if self.pending.fetch_add(1, Ordering::AcqRel) >= max_pending {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn release(&self, count: usize) {
        if count > 0 {
            self.pending.fetch_sub(count, Ordering::AcqRel);
        }
    }

    fn record_expired(&self, count: usize) {
        self.counters
            .expired
            .fetch_add(count as u64, Ordering::Relaxed);
        warn!("Expired {count} unmatched source records; their consumers will not be linked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn engine_with_ttl(ttl: Duration) -> CorrelationEngine {
        CorrelationEngine::new(CorrelationConfig {
            ttl,
            ..CorrelationConfig::default()
        })
    }

    #[test]
    fn test_single_consumer_match_retires_record() {
        let engine = CorrelationEngine::default();
        engine.register(SourceInfo::new("msg-1", "frag-a")).unwrap();

        let first = engine.match_id("msg-1");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].fragment_id, "frag-a");

        assert!(engine.match_id("msg-1").is_empty());
        let stats = engine.stats();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_unknown_id_is_a_miss() {
        let engine = CorrelationEngine::default();
        assert!(engine.match_id("nothing").is_empty());
        assert_eq!(engine.stats().misses, 1);
    }

    #[test]
    fn test_records_without_ids_are_refused() {
        let engine = CorrelationEngine::default();
        assert_eq!(
            engine.register(SourceInfo::new("", "frag")),
            Err(CorrelationError::MissingId)
        );
        assert_eq!(
            engine.register(SourceInfo::new("id", "")),
            Err(CorrelationError::MissingFragmentId("id".to_string()))
        );
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_concurrent_matches_retire_single_consumer_once() {
        const THREADS: usize = 16;
        let engine = CorrelationEngine::default();
        engine.register(SourceInfo::new("order-42", "frag")).unwrap();

        let barrier = Barrier::new(THREADS);
        let successes: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        engine.match_id("order-42").len()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(successes, 1);
        let stats = engine.stats();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.misses, (THREADS - 1) as u64);
    }

    #[test]
    fn test_fan_out_record_serves_every_consumer_until_retired() {
        const CONSUMERS: usize = 8;
        let engine = CorrelationEngine::default();
        let source = SourceInfo::new("topic-msg", "frag-pub").with_multiple_consumers(true);
        engine.register(source.clone()).unwrap();

        let barrier = Barrier::new(CONSUMERS);
        let results: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        engine.match_id("topic-msg").len()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(|&n| n == 1));
        assert_eq!(engine.stats().misses, 0);

        assert!(engine.retire(&source));
        assert!(!engine.retire(&source));
        assert!(engine.match_id("topic-msg").is_empty());
        assert_eq!(engine.stats().retired, 1);
    }

    #[test]
    fn test_shared_id_records_are_taken_in_registration_order() {
        let engine = CorrelationEngine::default();
        engine.register(SourceInfo::new("dup", "first")).unwrap();
        engine.register(SourceInfo::new("dup", "second")).unwrap();

        assert_eq!(engine.match_id("dup")[0].fragment_id, "first");
        assert_eq!(engine.match_id("dup")[0].fragment_id, "second");
        assert!(engine.match_id("dup").is_empty());
    }

    #[test]
    fn test_concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;
        let engine = CorrelationEngine::default();

        thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let engine = &engine;
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        engine
                            .register(SourceInfo::new(format!("{p}-{i}"), format!("frag-{p}")))
                            .unwrap();
                    }
                });
            }
        });

        let matched: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let engine = &engine;
                    scope.spawn(move || {
                        (0..PER_PRODUCER)
                            .map(|i| engine.match_id(&format!("{p}-{i}")).len())
                            .sum::<usize>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(matched, PRODUCERS * PER_PRODUCER);
        assert_eq!(engine.pending(), 0);
        assert_eq!(engine.stats().registered, (PRODUCERS * PER_PRODUCER) as u64);
    }

    #[test]
    fn test_expired_record_is_not_matched() {
        let engine = engine_with_ttl(Duration::from_millis(50));
        engine.register(SourceInfo::new("late", "frag")).unwrap();

        let later = Instant::now() + Duration::from_millis(100);
        assert!(engine.match_at("late", later).is_empty());

        let stats = engine.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_expired_fan_out_record_stops_matching() {
        let engine = engine_with_ttl(Duration::from_millis(50));
        engine
            .register(SourceInfo::new("pub", "frag").with_multiple_consumers(true))
            .unwrap();

        assert_eq!(engine.match_id("pub").len(), 1);
        let later = Instant::now() + Duration::from_millis(100);
        assert!(engine.match_at("pub", later).is_empty());
        assert_eq!(engine.stats().expired, 1);
    }

    #[test]
    fn test_evict_expired_sweeps_whole_index() {
        let engine = engine_with_ttl(Duration::from_millis(50));
        for i in 0..10 {
            engine.register(SourceInfo::new(format!("id-{i}"), "frag")).unwrap();
        }

        assert_eq!(engine.evict_expired(), 0);
        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(engine.evict_expired_at(later), 10);

        let stats = engine.stats();
        assert_eq!(stats.expired, 10);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_capacity_limit() {
        let engine = CorrelationEngine::new(CorrelationConfig {
            max_pending: 2,
            ..CorrelationConfig::default()
        });
        engine.register(SourceInfo::new("a", "f")).unwrap();
        engine.register(SourceInfo::new("b", "f")).unwrap();

        assert_eq!(
            engine.register(SourceInfo::new("c", "f")),
            Err(CorrelationError::CapacityExceeded(2))
        );
        assert_eq!(engine.stats().rejected, 1);

        engine.match_id("a");
        assert!(engine.register(SourceInfo::new("c", "f")).is_ok());
    }

    #[test]
    fn test_full_index_evicts_expired_records_before_refusing() {
        let engine = CorrelationEngine::new(CorrelationConfig {
            ttl: Duration::from_millis(20),
            max_pending: 2,
            ..CorrelationConfig::default()
        });
        let start = Instant::now();
        engine.register_at(SourceInfo::new("a", "f"), start).unwrap();
        engine.register_at(SourceInfo::new("b", "f"), start).unwrap();

        let later = start + Duration::from_millis(60);
        assert!(engine.register_at(SourceInfo::new("c", "f"), later).is_ok());

        let stats = engine.stats();
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.pending, 1);
        assert!(engine.match_at("a", later).is_empty());
        assert_eq!(engine.match_at("c", later).len(), 1);
    }

    #[test]
    fn test_complete_finalizes_duration() {
        let engine = CorrelationEngine::default();
        engine.register(SourceInfo::new("req", "frag")).unwrap();

        assert!(engine.complete("req", "frag", 125));
        assert!(!engine.complete("req", "other", 1));
        assert_eq!(engine.match_id("req")[0].duration, 125);
    }

    #[test]
    fn test_link_attaches_producer_fragments() {
        let engine = CorrelationEngine::default();
        engine
            .register(SourceInfo::new("call-7", "frag-client").with_host("client-host", "10.1.1.1"))
            .unwrap();

        let mut consumer = Fragment::new("frag-server");
        assert_eq!(engine.link(&mut consumer, "call-7"), 1);
        assert!(consumer.is_linked_to("call-7"));
        assert_eq!(consumer.links[0].source_fragment_id, "frag-client");

        assert_eq!(engine.link(&mut consumer, "call-7"), 0);
        assert_eq!(consumer.links.len(), 1);
    }

    #[test]
    fn test_matched_copies_share_the_registered_properties() {
        let engine = CorrelationEngine::default();
        let source = SourceInfo::new("p", "frag")
            .with_multiple_consumers(true)
            .with_property(apm_model::Property::text("k", "v"));
        engine.register(source.clone()).unwrap();

        let mut first = engine.match_id("p").remove(0);
        let second = engine.match_id("p").remove(0);
        assert!(first.shares_properties_with(&second));

        first.add_property(apm_model::Property::text("k2", "v2"));
        assert_eq!(engine.match_id("p")[0].properties().len(), 1);
        assert_eq!(second.properties().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_cancelled() {
        let engine = Arc::new(CorrelationEngine::new(CorrelationConfig {
            ttl: Duration::from_millis(1),
            sweep_interval: Duration::from_millis(100),
            max_pending: 10,
        }));
        engine.register(SourceInfo::new("x", "frag")).unwrap();

        let cancel = CancellationToken::new();
        let sweeper = engine.spawn_sweeper(cancel.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.stats().expired, 1);
        cancel.cancel();
        sweeper.await.unwrap();
    }
}
