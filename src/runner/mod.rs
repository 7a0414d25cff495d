//! Ordered, bounded-concurrency matching runs with checkpointed progress.

pub mod feed;
pub mod progress;

use anyhow::{Context, Result};
use futures::future;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::candidates::CandidateSource;
use crate::checkpoint::{CheckpointError, CheckpointState, CheckpointStore, MethodStats};
use crate::entity::{MatchResult, PendingAdjudication, ResolvableEntity};
use crate::links::LatestResults;
use crate::matching::{MatchOutcome, Matcher};
use crate::TARGET_RUNNER;

pub use feed::{EntityFeed, VecFeed};
pub use progress::{ObservabilitySink, ProgressReport, ProgressReporter, RecordingSink, TracingSink};

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 50;
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// SHA-256 over the local ids of the processed prefix, one decimal id per line.
#[derive(Debug, Clone, Default)]
pub struct OrderingDigest {
    hasher: Sha256,
}

impl OrderingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, local_id: i64) {
        self.hasher.update(format!("{}\n", local_id).as_bytes());
    }

    pub fn hex(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    /// Committed results between checkpoint publications.
    pub checkpoint_interval: usize,
    /// Continue from the stored checkpoint; when false the checkpoint is moved aside first.
    pub resume: bool,
    /// Maximum entities processed by this run.
    pub limit: Option<usize>,
    pub skip_adjudication: bool,
    pub page_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            resume: true,
            limit: None,
            skip_adjudication: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Entities committed by this run.
    pub processed: usize,
    pub committed_offset: usize,
    pub total: usize,
    /// Counters for this run only.
    pub stats: MethodStats,
    pub pending_adjudication: usize,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failure_rate(&self) -> f64 {
        if self.stats.total == 0 {
            0.0
        } else {
            self.stats.failed as f64 / self.stats.total as f64
        }
    }
}

/// Outcome of a follow-up pass (`adjudicate` or `retry-failed`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowupSummary {
    pub attempted: usize,
    pub matched: usize,
    pub still_pending: usize,
    pub failed: usize,
    /// Queued entities no longer present in the feed.
    pub missing: usize,
}

impl FollowupSummary {
    fn record(&mut self, outcome: &MatchOutcome) {
        self.attempted += 1;
        if outcome.result.is_matched() {
            self.matched += 1;
        }
        if outcome.result.error.is_some() {
            self.failed += 1;
        }
        if outcome.pending.is_some() {
            self.still_pending += 1;
        }
    }
}

/// Follow-up work not yet written: superseding results and the entities they
/// re-queued for adjudication.
#[derive(Default)]
struct FollowupBatch {
    handled: HashSet<i64>,
    results: Vec<MatchResult>,
    requeued: Vec<PendingAdjudication>,
}

impl FollowupBatch {
    /// Appends the results to `followup`, then publishes the main queue with the
    /// handled entities replaced by whatever they queued anew.
    fn flush(&mut self, main: &mut dyn CheckpointStore, followup: &mut dyn CheckpointStore) -> Result<()> {
        if self.handled.is_empty() {
            return Ok(());
        }
        if !self.results.is_empty() {
            followup.append(&self.results, Vec::new(), "")?;
        }
        let mut queue: Vec<PendingAdjudication> = main
            .state()
            .llm_pending
            .iter()
            .filter(|p| !self.handled.contains(&p.local_id))
            .cloned()
            .collect();
        queue.append(&mut self.requeued);
        main.publish_pending(queue)?;
        debug!(
            target: TARGET_RUNNER,
            "Follow-up checkpoint: {} results, {} entities handled",
            self.results.len(),
            self.handled.len()
        );
        self.handled.clear();
        self.results.clear();
        Ok(())
    }
}

/// Turns interrupts into a shutdown channel for [`JobRunner::with_shutdown`].
/// The first interrupt asks for a graceful stop; a second one calls `force`.
pub fn shutdown_signal<I, Fut, F>(mut interrupt: I, force: F) -> watch::Receiver<bool>
where
    I: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = std::io::Result<()>> + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = interrupt().await {
            error!(target: TARGET_RUNNER, "Failed to listen for interrupts: {}", e);
            return;
        }
        warn!(
            target: TARGET_RUNNER,
            "Shutdown requested, finishing in-flight entities (interrupt again to exit now)"
        );
        let _ = cancel_tx.send(true);

        if interrupt().await.is_ok() {
            error!(target: TARGET_RUNNER, "Second interrupt, exiting without flushing");
            force();
        }
    });
    cancel_rx
}

/// Year that decides which search hits get a detail fetch first.
fn entity_hint(entity: &ResolvableEntity) -> Option<String> {
    entity
        .bounds
        .start
        .or(entity.bounds.end)
        .map(|year| year.to_string())
}

async fn resolve_entity(
    source: &dyn CandidateSource,
    matcher: &Matcher,
    entity: &ResolvableEntity,
    skip_adjudication: bool,
) -> MatchOutcome {
    let hint = entity_hint(entity);
    let fetch = source.fetch(&entity.display_name, hint.as_deref()).await;
    match fetch.error {
        Some(error) if fetch.candidates.is_empty() => {
            warn!(
                target: TARGET_RUNNER,
                "Candidate fetch failed for {} '{}': {}", entity.local_id, entity.display_name, error
            );
            MatchOutcome {
                result: MatchResult::failed(entity, error),
                pending: None,
            }
        }
        partial_error => {
            let mut outcome = matcher
                .resolve(entity, &fetch.candidates, skip_adjudication)
                .await;
            if outcome.result.error.is_none() {
                outcome.result.error = partial_error;
            }
            outcome
        }
    }
}

pub struct JobRunner {
    source: Arc<dyn CandidateSource>,
    matcher: Arc<Matcher>,
    sink: Arc<dyn ObservabilitySink>,
    shutdown: watch::Receiver<bool>,
}

impl JobRunner {
    pub fn new(source: Arc<dyn CandidateSource>, matcher: Arc<Matcher>) -> Self {
        let (_never_sent, shutdown) = watch::channel(false);
        Self {
            source,
            matcher,
            sink: Arc::new(TracingSink),
            shutdown,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stops dispatching new entities once `true` is sent. In-flight entities
    /// finish and the committed prefix is flushed.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Fetches and matches one entity on its own task, so a panic costs one
    /// result rather than the run.
    fn spawn_resolve(
        &self,
        entity: ResolvableEntity,
        skip_adjudication: bool,
    ) -> impl Future<Output = MatchOutcome> + Send + 'static {
        let source = Arc::clone(&self.source);
        let matcher = Arc::clone(&self.matcher);
        async move {
            let task = tokio::spawn({
                let entity = entity.clone();
                async move { resolve_entity(source.as_ref(), &matcher, &entity, skip_adjudication).await }
            });
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        target: TARGET_RUNNER,
                        "Worker task for {} '{}' failed: {}", entity.local_id, entity.display_name, e
                    );
                    MatchOutcome {
                        result: MatchResult::failed(&entity, format!("worker task failed: {}", e)),
                        pending: None,
                    }
                }
            }
        }
    }

    /// Recomputes the digest of the already processed prefix and compares it
    /// with the stored one.
    async fn verify_prefix(
        &self,
        feed: &dyn EntityFeed,
        state: &CheckpointState,
        page_size: usize,
    ) -> Result<OrderingDigest> {
        let mut digest = OrderingDigest::new();
        let mut offset = 0;
        while offset < state.last_offset {
            let wanted = page_size.min(state.last_offset - offset);
            let page = feed
                .page(offset, wanted)
                .await
                .with_context(|| format!("Failed to read entities at offset {}", offset))?;
            if page.is_empty() {
                return Err(CheckpointError::OrderingChanged {
                    stored: state.ordering_digest.clone(),
                    current: format!("feed ends at {} of {} processed", offset, state.last_offset),
                }
                .into());
            }
            for entity in page.iter().take(wanted) {
                digest.update(entity.local_id);
            }
            offset += page.len().min(wanted);
        }

        let current = digest.hex();
        if state.ordering_digest.is_empty() {
            if state.last_offset > 0 {
                warn!(
                    target: TARGET_RUNNER,
                    "Checkpoint carries no ordering digest; adopting the current one for {} processed entities",
                    state.last_offset
                );
            }
        } else if state.ordering_digest != current {
            return Err(CheckpointError::OrderingChanged {
                stored: state.ordering_digest.clone(),
                current,
            }
            .into());
        }
        Ok(digest)
    }

    fn flush(
        &self,
        store: &mut dyn CheckpointStore,
        ready: &mut Vec<MatchResult>,
        pending: &mut Vec<PendingAdjudication>,
        digest: &OrderingDigest,
    ) -> Result<()> {
        if ready.is_empty() && pending.is_empty() {
            return Ok(());
        }
        store.append(ready, std::mem::take(pending), &digest.hex())?;
        debug!(
            target: TARGET_RUNNER,
            "Checkpointed {} results, offset now {}",
            ready.len(),
            store.state().last_offset
        );
        ready.clear();
        Ok(())
    }

    /// Matches the feed from the stored offset onward. A fresh run (`resume`
    /// unset) moves both the checkpoint and the follow-up results aside, since
    /// follow-up results refer to the run being discarded.
    pub async fn run(
        &self,
        feed: &dyn EntityFeed,
        store: &mut dyn CheckpointStore,
        followup: &mut dyn CheckpointStore,
        options: &RunOptions,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        if !options.resume {
            if let Some(backup) = store.reset()? {
                info!(target: TARGET_RUNNER, "Starting fresh; previous checkpoint kept at {}", backup.display());
            }
            if let Some(backup) = followup.reset()? {
                info!(target: TARGET_RUNNER, "Previous follow-up results kept at {}", backup.display());
            }
        }

        let state = store.load()?;
        let total = feed.total().await.context("Failed to count entities")?;
        let page_size = options.page_size.max(1);
        let mut digest = self.verify_prefix(feed, &state, page_size).await?;

        let start = state.last_offset;
        let end = options
            .limit
            .map_or(total, |limit| total.min(start.saturating_add(limit)))
            .max(start);
        info!(
            target: TARGET_RUNNER,
            "Processing entities {}..{} of {} with {} workers",
            start,
            end,
            total,
            options.concurrency.max(1)
        );

        let reporter = ProgressReporter::new(start, end, total);
        let feed_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let feed_error_slot = &feed_error;
        let pages = stream::unfold(start, move |offset| async move {
            if offset >= end {
                return None;
            }
            match feed.page(offset, page_size.min(end - offset)).await {
                Ok(page) if page.is_empty() => {
                    warn!(target: TARGET_RUNNER, "Entity feed ended early at offset {}", offset);
                    None
                }
                Ok(mut page) => {
                    page.truncate(end - offset);
                    let next = offset + page.len();
                    Some((page, next))
                }
                Err(e) => {
                    if let Ok(mut slot) = feed_error_slot.lock() {
                        *slot = Some(e.context(format!("Failed to read entities at offset {}", offset)));
                    }
                    None
                }
            }
        });

        let shutdown = self.shutdown.clone();
        let skip_adjudication = options.skip_adjudication;
        let mut outcomes = std::pin::pin!(pages
            .flat_map(stream::iter)
            .enumerate()
            .take_while(move |_| future::ready(!*shutdown.borrow()))
            .map(|(index, entity)| {
                let resolving = self.spawn_resolve(entity, skip_adjudication);
                async move { (start + index, resolving.await) }
            })
            .buffer_unordered(options.concurrency.max(1)));

        let mut reorder: BTreeMap<usize, MatchOutcome> = BTreeMap::new();
        let mut next_offset = start;
        let mut ready: Vec<MatchResult> = Vec::new();
        let mut new_pending: Vec<PendingAdjudication> = Vec::new();
        let mut run_stats = MethodStats::default();
        let checkpoint_interval = options.checkpoint_interval.max(1);

        while let Some((offset, outcome)) = outcomes.next().await {
            reorder.insert(offset, outcome);
            // Only the contiguous prefix may be committed.
            while let Some(outcome) = reorder.remove(&next_offset) {
                digest.update(outcome.result.local_id);
                run_stats.record(&outcome.result);
                new_pending.extend(outcome.pending);
                ready.push(outcome.result);
                next_offset += 1;
            }

            if ready.len() >= checkpoint_interval {
                self.flush(store, &mut ready, &mut new_pending, &digest)?;
                self.sink
                    .progress(&reporter.report(next_offset, run_stats.failed as usize));
            }
        }

        self.flush(store, &mut ready, &mut new_pending, &digest)?;
        self.sink
            .progress(&reporter.report(next_offset, run_stats.failed as usize));

        let feed_failure = feed_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(e) = feed_failure {
            error!(target: TARGET_RUNNER, "Stopping run after committing offset {}: {:#}", next_offset, e);
            return Err(e);
        }

        let summary = RunSummary {
            processed: next_offset - start,
            committed_offset: store.state().last_offset,
            total,
            stats: run_stats,
            pending_adjudication: store.state().llm_pending.len(),
            interrupted: next_offset < end,
            elapsed: started.elapsed(),
        };
        self.sink.finished(&summary);
        Ok(summary)
    }

    /// Loads one queued entity and resolves it again. A load failure becomes a
    /// failed result so the entity shows up in the next retry pass.
    async fn reload_and_resolve(
        &self,
        feed: &dyn EntityFeed,
        local_id: i64,
        local_name: String,
        skip_adjudication: bool,
    ) -> (i64, Option<MatchOutcome>) {
        match feed.get(local_id).await {
            Ok(Some(entity)) => (local_id, Some(self.spawn_resolve(entity, skip_adjudication).await)),
            Ok(None) => {
                warn!(target: TARGET_RUNNER, "Entity {} is no longer in the feed", local_id);
                (local_id, None)
            }
            Err(e) => {
                error!(target: TARGET_RUNNER, "Failed to load entity {} '{}': {:#}", local_id, local_name, e);
                let entity = ResolvableEntity::new(local_id, &local_name);
                let outcome = MatchOutcome {
                    result: MatchResult::failed(&entity, format!("failed to load entity: {:#}", e)),
                    pending: None,
                };
                (local_id, Some(outcome))
            }
        }
    }

    /// Resolves the given entities again, in order, checkpointing every
    /// `checkpoint_interval` entities. Stops early on shutdown.
    async fn reprocess(
        &self,
        feed: &dyn EntityFeed,
        main: &mut dyn CheckpointStore,
        followup: &mut dyn CheckpointStore,
        queued: Vec<(i64, String)>,
        skip_adjudication: bool,
        options: &RunOptions,
    ) -> Result<FollowupSummary> {
        let shutdown = self.shutdown.clone();
        let mut outcomes = std::pin::pin!(stream::iter(queued)
            .take_while(move |_| future::ready(!*shutdown.borrow()))
            .map(|(local_id, local_name)| {
                self.reload_and_resolve(feed, local_id, local_name, skip_adjudication)
            })
            .buffered(options.concurrency.max(1)));

        let checkpoint_interval = options.checkpoint_interval.max(1);
        let mut summary = FollowupSummary::default();
        let mut batch = FollowupBatch::default();
        while let Some((local_id, outcome)) = outcomes.next().await {
            batch.handled.insert(local_id);
            match outcome {
                Some(outcome) => {
                    summary.record(&outcome);
                    batch.requeued.extend(outcome.pending);
                    batch.results.push(outcome.result);
                }
                None => summary.missing += 1,
            }
            if batch.handled.len() >= checkpoint_interval {
                batch.flush(main, followup)?;
            }
        }
        batch.flush(main, followup)?;
        Ok(summary)
    }

    /// Runs the deferred adjudication queue. Superseding results go to
    /// `followup`; entities that stay undecided remain queued.
    pub async fn adjudicate_pending(
        &self,
        feed: &dyn EntityFeed,
        main: &mut dyn CheckpointStore,
        followup: &mut dyn CheckpointStore,
        options: &RunOptions,
    ) -> Result<FollowupSummary> {
        if !self.matcher.has_adjudicator() {
            anyhow::bail!("No adjudicator configured; set LORELINK_LLM_MODEL or check the LLM settings");
        }
        main.load()?;
        followup.load()?;

        let queue = &main.state().llm_pending;
        let queued: Vec<(i64, String)> = queue
            .iter()
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|p| (p.local_id, p.local_name.clone()))
            .collect();
        info!(target: TARGET_RUNNER, "Adjudicating {} of {} queued entities", queued.len(), queue.len());

        let summary = self
            .reprocess(feed, main, followup, queued, false, options)
            .await?;

        info!(
            target: TARGET_RUNNER,
            "Adjudication pass: {} attempted, {} matched, {} still pending, {} failed, {} missing",
            summary.attempted, summary.matched, summary.still_pending, summary.failed, summary.missing
        );
        Ok(summary)
    }

    /// Reprocesses entities whose latest result recorded an error.
    pub async fn retry_failed(
        &self,
        feed: &dyn EntityFeed,
        main: &mut dyn CheckpointStore,
        followup: &mut dyn CheckpointStore,
        options: &RunOptions,
    ) -> Result<FollowupSummary> {
        main.load()?;
        followup.load()?;

        let limit = options.limit.unwrap_or(usize::MAX);
        let mut failed: Vec<(i64, String)> = Vec::new();
        for batch in LatestResults::index(&*main, &*followup)?.batches() {
            failed.extend(
                batch?
                    .into_iter()
                    .filter(|result| result.error.is_some())
                    .map(|result| (result.local_id, result.local_name)),
            );
            if failed.len() >= limit {
                failed.truncate(limit);
                break;
            }
        }
        info!(target: TARGET_RUNNER, "Retrying {} failed entities", failed.len());

        let summary = self
            .reprocess(feed, main, followup, failed, options.skip_adjudication, options)
            .await?;

        info!(
            target: TARGET_RUNNER,
            "Retry pass: {} attempted, {} matched, {} pending adjudication, {} failed again",
            summary.attempted, summary.matched, summary.still_pending, summary.failed
        );
        Ok(summary)
    }
}
