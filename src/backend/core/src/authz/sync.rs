//! Background synchronization of the authorization index.
//!
//! One running cache owns these tasks:
//! - **worker**: the only task that mutates the index. Performs the startup
//!   rebuild, then serially applies feed events and resync requests.
//! - **pumps** (one per feed): forward watch events to the worker; on a feed
//!   error they resubscribe after a backoff and request a resync.
//! - **timer**: requests a periodic resync to bound staleness.
//!
//! Resync requests travel over a channel of capacity one, so any number of
//! requests made while one is pending collapse into it.

use futures::future::try_join;
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::index::{AuthorizationIndex, RebuildSummary, Snapshot, UpdateOutcome};
use super::lifecycle::{Lifecycle, StopSignal};
use crate::error::{ErrorContext, Result};
use crate::feed::{ChangeEvent, Resource, ResourceFeed, WatchEvent, WatchStream};
use crate::rbac::RoleBinding;
use crate::telemetry::{CacheMetrics, OperationTimer};
use crate::tenancy::WorkspaceRecord;

// ═══════════════════════════════════════════════════════════════════════════════
// Resync Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a full rebuild was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    Startup,
    Periodic,
    FeedGap,
    Inconclusive,
    Manual,
}

impl ResyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Periodic => "periodic",
            Self::FeedGap => "feed_gap",
            Self::Inconclusive => "inconclusive",
            Self::Manual => "manual",
        }
    }
}

/// Sender side of the coalescing resync channel.
#[derive(Debug, Clone)]
pub struct ResyncRequester {
    organization: Arc<str>,
    sender: mpsc::Sender<ResyncReason>,
    stats: SyncStats,
}

impl ResyncRequester {
    /// Request a rebuild. Returns `false` if the loop has stopped.
    pub fn request(&self, reason: ResyncReason) -> bool {
        let (accepted, coalesced) = match self.sender.try_send(reason) {
            Ok(()) => (true, false),
            Err(TrySendError::Full(_)) => (true, true),
            Err(TrySendError::Closed(_)) => (false, false),
        };
        if accepted {
            self.stats.resyncs_requested.fetch_add(1, Ordering::Relaxed);
            if coalesced {
                self.stats.resyncs_coalesced.fetch_add(1, Ordering::Relaxed);
            }
            CacheMetrics::record_resync_request(&self.organization, reason.as_str(), coalesced);
            debug!(
                organization = %self.organization,
                reason = reason.as_str(),
                coalesced,
                "Resync requested"
            );
        }
        accepted
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters for one cache's sync loop.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub rebuilds: Arc<AtomicU64>,
    pub failed_rebuilds: Arc<AtomicU64>,
    pub events_applied: Arc<AtomicU64>,
    pub events_duplicate: Arc<AtomicU64>,
    pub events_stale: Arc<AtomicU64>,
    pub events_inconclusive: Arc<AtomicU64>,
    pub feed_restarts: Arc<AtomicU64>,
    pub resyncs_requested: Arc<AtomicU64>,
    pub resyncs_coalesced: Arc<AtomicU64>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    pub fn failed_rebuilds(&self) -> u64 {
        self.failed_rebuilds.load(Ordering::Relaxed)
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    pub fn events_duplicate(&self) -> u64 {
        self.events_duplicate.load(Ordering::Relaxed)
    }

    pub fn events_stale(&self) -> u64 {
        self.events_stale.load(Ordering::Relaxed)
    }

    pub fn events_inconclusive(&self) -> u64 {
        self.events_inconclusive.load(Ordering::Relaxed)
    }

    pub fn feed_restarts(&self) -> u64 {
        self.feed_restarts.load(Ordering::Relaxed)
    }

    pub fn resyncs_requested(&self) -> u64 {
        self.resyncs_requested.load(Ordering::Relaxed)
    }

    pub fn resyncs_coalesced(&self) -> u64 {
        self.resyncs_coalesced.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            rebuilds: self.rebuilds(),
            failed_rebuilds: self.failed_rebuilds(),
            events_applied: self.events_applied(),
            events_duplicate: self.events_duplicate(),
            events_stale: self.events_stale(),
            events_inconclusive: self.events_inconclusive(),
            feed_restarts: self.feed_restarts(),
            resyncs_requested: self.resyncs_requested(),
            resyncs_coalesced: self.resyncs_coalesced(),
        }
    }

    fn record_outcome(&self, outcome: &UpdateOutcome) {
        let counter = match outcome {
            UpdateOutcome::Applied { .. } => &self.events_applied,
            UpdateOutcome::Duplicate => &self.events_duplicate,
            UpdateOutcome::Stale => &self.events_stale,
            UpdateOutcome::Inconclusive { .. } => &self.events_inconclusive,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    pub rebuilds: u64,
    pub failed_rebuilds: u64,
    pub events_applied: u64,
    pub events_duplicate: u64,
    pub events_stale: u64,
    pub events_inconclusive: u64,
    pub feed_restarts: u64,
    pub resyncs_requested: u64,
    pub resyncs_coalesced: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync Loop
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncSettings {
    pub resync_interval: Duration,
    pub retry_backoff: Duration,
    pub event_buffer: usize,
}

/// Everything the background tasks share.
pub(crate) struct SyncLoop {
    pub organization: Arc<str>,
    pub index: Arc<AuthorizationIndex>,
    pub workspaces: Arc<dyn ResourceFeed<WorkspaceRecord>>,
    pub bindings: Arc<dyn ResourceFeed<RoleBinding>>,
    pub lifecycle: Arc<Lifecycle>,
    pub stats: SyncStats,
    pub settings: SyncSettings,
}

impl SyncLoop {
    /// Subscribe to both feeds and spawn the background tasks on `runtime`.
    ///
    /// The subscriptions are registered before this returns, so the worker's
    /// first list cannot miss an event.
    pub(crate) fn spawn(
        self,
        runtime: &Handle,
        stop: StopSignal,
    ) -> (ResyncRequester, Vec<JoinHandle<()>>) {
        let this = Arc::new(self);
        let (events_tx, events_rx) = mpsc::channel(this.settings.event_buffer.max(1));
        let (resync_tx, resync_rx) = mpsc::channel(1);
        let resync = ResyncRequester {
            organization: this.organization.clone(),
            sender: resync_tx,
            stats: this.stats.clone(),
        };

        let workspace_stream = this.workspaces.watch();
        let binding_stream = this.bindings.watch();

        let tasks = vec![
            runtime.spawn(pump(
                this.clone(),
                this.workspaces.clone(),
                workspace_stream,
                events_tx.clone(),
                resync.clone(),
                stop.clone(),
            )),
            runtime.spawn(pump(
                this.clone(),
                this.bindings.clone(),
                binding_stream,
                events_tx,
                resync.clone(),
                stop.clone(),
            )),
            runtime.spawn(timer(this.clone(), resync.clone(), stop.clone())),
            runtime.spawn(worker(this, events_rx, resync_rx, resync.clone(), stop)),
        ];

        (resync, tasks)
    }

    async fn rebuild(&self, reason: ResyncReason) -> Result<RebuildSummary> {
        let timer = OperationTimer::start();
        let result = self.try_rebuild().await;
        let duration = timer.elapsed();
        CacheMetrics::record_rebuild(&self.organization, reason.as_str(), duration, result.is_ok());

        match &result {
            Ok(summary) => {
                self.stats.rebuilds.fetch_add(1, Ordering::Relaxed);
                info!(
                    organization = %self.organization,
                    reason = reason.as_str(),
                    generation = summary.generation,
                    changed = summary.changed,
                    duration_ms = duration.as_millis() as u64,
                    "Resync completed"
                );
            }
            Err(err) => {
                self.stats.failed_rebuilds.fetch_add(1, Ordering::Relaxed);
                warn!(
                    organization = %self.organization,
                    reason = reason.as_str(),
                    error = %err,
                    "Resync failed"
                );
                err.log();
            }
        }
        result
    }

    async fn try_rebuild(&self) -> Result<RebuildSummary> {
        let (workspaces, bindings) = try_join(self.workspaces.list(), self.bindings.list()).await?;
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || index.full_rebuild(Snapshot::new(workspaces, bindings)))
            .await
            .context("rebuild task failed")?
    }

    /// Policy evaluation for a broad binding can touch every workspace, so
    /// updates run on the blocking pool like rebuilds do.
    async fn apply(&self, event: ChangeEvent, resync: &ResyncRequester) {
        let index = self.index.clone();
        let outcome = match tokio::task::spawn_blocking(move || index.update(event)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    organization = %self.organization,
                    error = %err,
                    "Update task failed, requesting resync"
                );
                resync.request(ResyncReason::Inconclusive);
                return;
            }
        };
        self.stats.record_outcome(&outcome);
        if outcome.is_inconclusive() {
            resync.request(ResyncReason::Inconclusive);
        }
    }
}

async fn worker(
    sync: Arc<SyncLoop>,
    mut events: mpsc::Receiver<ChangeEvent>,
    mut resyncs: mpsc::Receiver<ResyncReason>,
    resync: ResyncRequester,
    stop: StopSignal,
) {
    info!(organization = %sync.organization, "Authorization cache sync started");

    // Startup: no readiness until one rebuild succeeds.
    loop {
        if sync.rebuild(ResyncReason::Startup).await.is_ok() {
            CacheMetrics::set_ready(&sync.organization, true);
            sync.lifecycle.mark_ready();
            info!(organization = %sync.organization, "Authorization cache ready");
            break;
        }
        tokio::select! {
            biased;
            _ = stop.fired() => {
                info!(organization = %sync.organization, "Stopped before first successful rebuild");
                return;
            }
            _ = tokio::time::sleep(sync.settings.retry_backoff) => {}
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = stop.fired() => break,
            Some(reason) = resyncs.recv() => {
                let _ = sync.rebuild(reason).await;
            }
            Some(event) = events.recv() => sync.apply(event, &resync).await,
            else => break,
        }
    }

    info!(organization = %sync.organization, "Authorization cache sync stopped");
}

async fn pump<T>(
    sync: Arc<SyncLoop>,
    feed: Arc<dyn ResourceFeed<T>>,
    mut stream: WatchStream<T>,
    events: mpsc::Sender<ChangeEvent>,
    resync: ResyncRequester,
    stop: StopSignal,
) where
    T: Resource,
    ChangeEvent: From<WatchEvent<T>>,
{
    loop {
        let reason = loop {
            tokio::select! {
                biased;
                _ = stop.fired() => return,
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if events.send(event.into()).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => break err.to_string(),
                    None => break format!("{} feed closed", T::KIND),
                },
            }
        };

        sync.stats.feed_restarts.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::record_feed_restart(&sync.organization, T::KIND);
        error!(
            organization = %sync.organization,
            kind = T::KIND,
            reason = %reason,
            backoff_ms = sync.settings.retry_backoff.as_millis() as u64,
            "Watch interrupted, resubscribing"
        );

        tokio::select! {
            biased;
            _ = stop.fired() => return,
            _ = tokio::time::sleep(sync.settings.retry_backoff) => {}
        }

        // Resubscribe before requesting the resync so its list covers the gap.
        stream = feed.watch();
        resync.request(ResyncReason::FeedGap);
    }
}

async fn timer(sync: Arc<SyncLoop>, resync: ResyncRequester, stop: StopSignal) {
    let period = sync.settings.resync_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.fired() => break,
            _ = ticker.tick() => {
                resync.request(ResyncReason::Periodic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester(capacity: usize) -> (ResyncRequester, mpsc::Receiver<ResyncReason>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            ResyncRequester {
                organization: Arc::from("org"),
                sender,
                stats: SyncStats::new(),
            },
            receiver,
        )
    }

    #[tokio::test]
    async fn test_resync_requests_coalesce() {
        let (resync, mut rx) = requester(1);

        assert!(resync.request(ResyncReason::Periodic));
        assert!(resync.request(ResyncReason::FeedGap));
        assert!(resync.request(ResyncReason::Inconclusive));

        assert_eq!(rx.recv().await, Some(ResyncReason::Periodic));
        assert!(rx.try_recv().is_err());
        assert_eq!(resync.stats.resyncs_requested(), 3);
        assert_eq!(resync.stats.resyncs_coalesced(), 2);
    }

    #[tokio::test]
    async fn test_resync_request_after_close() {
        let (resync, rx) = requester(1);
        drop(rx);
        assert!(!resync.request(ResyncReason::Manual));
        assert_eq!(resync.stats.resyncs_requested(), 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = SyncStats::new();
        stats.record_outcome(&UpdateOutcome::Applied { changed: 1 });
        stats.record_outcome(&UpdateOutcome::Stale);
        stats.record_outcome(&UpdateOutcome::Inconclusive {
            reason: "boom".into(),
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_applied, 1);
        assert_eq!(snapshot.events_stale, 1);
        assert_eq!(snapshot.events_inconclusive, 1);
        assert_eq!(snapshot.events_duplicate, 0);
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(ResyncReason::FeedGap.as_str(), "feed_gap");
        assert_eq!(
            serde_json::to_value(ResyncReason::Inconclusive).unwrap(),
            "inconclusive"
        );
    }
}
