//! Window pipeline orchestration.
//!
//! A run takes the window lock, keeps its lease alive while it works, reads the window's committed stage and then
//! executes the requested stages in fixed order:
//!
//! ```text
//! ingest → summarize → embed → dedup → publish
//! ```
//!
//! Stages that are already committed are skipped unless `force` is set.
//! Each stage commits its status change in the same transaction as its last
//! write, so an interrupted run resumes at the first uncommitted stage. That
//! transaction also re-checks the lease, so a run that lost the window to
//! another run cannot commit.
//! Summarize and embed commit per item and pick up only items that still
//! lack their output.
//!
//! Failure policy:
//! - transient collaborator errors are retried with backoff; once the
//!   budget is spent the window moves to `failed` and the run stops.
//! - malformed output and permanent errors for a single item skip that item.
//! - publishing a window that already has a publish record is a no-op that
//!   reports the original receipt.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::{DedupStats, SemanticClusterer};
use crate::config::Config;
use crate::embedding::{self, validate_embedding};
use crate::error::{PipelineError, ProviderError, Result};
use crate::exact_dedup::ExactDedupIndex;
use crate::models::{Item, PublishReceipt, RawItem, Stage, Step, Window};
use crate::normalize::{content_hash, normalize_text};
use crate::publish::{assemble_digest, OutboxPublisher};
use crate::retry::RetryPolicy;
use crate::source::JsonlSource;
use crate::state::{WindowLock, WindowStateStore};
use crate::store;
use crate::summarize;
use crate::traits::{ContentSource, EmbeddingProvider, Publisher, SummarizationProvider};
use crate::window;

/// External collaborators a pipeline talks to. A `None` provider turns its
/// stage into a recorded no-op.
pub struct Collaborators {
    pub source: Arc<dyn ContentSource>,
    pub summarizer: Option<Arc<dyn SummarizationProvider>>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub publisher: Arc<dyn Publisher>,
}

pub struct PipelineSettings {
    pub timezone: Tz,
    pub anchor_hour: u32,
    pub anchor_minute: u32,
    pub threshold: f32,
    pub top_k: usize,
    pub mark_exact_duplicates: bool,
    /// Applied to every collaborator call.
    pub retry: RetryPolicy,
    /// Applied while waiting for another run's window lock.
    pub lock_retry: RetryPolicy,
    pub lease: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            timezone: window::parse_timezone(&config.window.timezone)?,
            anchor_hour: config.window.anchor_hour,
            anchor_minute: config.window.anchor_minute,
            threshold: config.dedup.threshold,
            top_k: config.dedup.top_k,
            mark_exact_duplicates: config.dedup.mark_exact_duplicates,
            retry: config.retry.policy(),
            lock_retry: config.retry.lock_policy(),
            lease: Duration::seconds(config.lock.lease_secs),
        })
    }
}

/// Counters for one executed stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStats {
    /// Items whose output was produced by this stage.
    pub processed: usize,
    /// Items already stored, or whose output was copied from an exact
    /// duplicate.
    pub reused: usize,
    /// Items skipped for integrity or permanent provider errors, or for
    /// falling outside the window.
    pub skipped: usize,
    pub duplicates_flagged: usize,
    pub provider_disabled: bool,
    pub dedup: Option<DedupStats>,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Committed by an earlier run.
    Skipped,
    Completed(StageStats),
    /// The window already had a publish record; nothing was sent.
    AlreadyPublished(PublishReceipt),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub window: Window,
    pub outcomes: Vec<(Step, StageOutcome)>,
    /// Last committed stage after the run.
    pub completed: Stage,
    pub duration: std::time::Duration,
}

impl RunReport {
    /// True when the run did no work at all.
    pub fn is_noop(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, o)| matches!(o, StageOutcome::Skipped | StageOutcome::AlreadyPublished(_)))
    }

    pub fn outcome(&self, step: Step) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }
}

pub struct PipelineOrchestrator {
    state: WindowStateStore,
    collaborators: Collaborators,
    settings: PipelineSettings,
    clusterer: SemanticClusterer,
    holder: String,
}

impl PipelineOrchestrator {
    pub fn new(pool: SqlitePool, collaborators: Collaborators, settings: PipelineSettings) -> Result<Self> {
        let clusterer = SemanticClusterer::new(settings.threshold, settings.top_k)?;
        Ok(Self {
            state: WindowStateStore::new(pool),
            collaborators,
            settings,
            clusterer,
            holder: format!("wdigest-{}", Uuid::new_v4()),
        })
    }

    /// Build an orchestrator with the built-in collaborators named in
    /// `config`.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let settings = PipelineSettings::from_config(config)?;
        let source = config
            .source
            .as_ref()
            .ok_or_else(|| PipelineError::Config("[source] section is required to run the pipeline".into()))?;
        let publish = config
            .publish
            .as_ref()
            .ok_or_else(|| PipelineError::Config("[publish] section is required to run the pipeline".into()))?;

        let collaborators = Collaborators {
            source: Arc::new(JsonlSource::new(source)?),
            summarizer: summarize::create_provider(&config.summarize)?,
            embedder: embedding::create_provider(&config.embedding)?,
            publisher: Arc::new(OutboxPublisher::new(publish)),
        };
        Self::new(pool, collaborators, settings)
    }

    pub fn state(&self) -> &WindowStateStore {
        &self.state
    }

    fn pool(&self) -> &SqlitePool {
        self.state.pool()
    }

    /// Window containing `reference`.
    pub fn window_at(&self, reference: DateTime<Utc>) -> Result<Window> {
        window::compute(
            reference,
            self.settings.anchor_hour,
            self.settings.anchor_minute,
            self.settings.timezone,
        )
    }

    /// Most recent window that has fully closed at `now`.
    pub fn last_closed_window(&self, now: DateTime<Utc>) -> Result<Window> {
        let current = self.window_at(now)?;
        self.window_at(current.start - Duration::seconds(1))
    }

    /// Run every stage for the window that closed most recently.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let window = self.last_closed_window(now)?;
        self.run(&window, &Step::ALL, false).await
    }

    /// Run `steps` for `window`. With `force`, already committed stages are
    /// executed again.
    pub async fn run(&self, window: &Window, steps: &[Step], force: bool) -> Result<RunReport> {
        let started = Instant::now();
        let lock = self
            .state
            .lock(&window.id, &self.holder, self.settings.lease, &self.settings.lock_retry)
            .await?;

        let result = tokio::select! {
            result = self.run_locked(window, steps, force, &lock) => result,
            err = self.keep_lease(&lock) => Err(err),
        };

        if let Err(e) = self.state.release_lock(&lock).await {
            warn!(window_id = %window.id, error = %e, "failed to release window lock");
        }

        let mut report = result?;
        report.duration = started.elapsed();
        info!(
            window_id = %window.id,
            completed = report.completed.as_str(),
            noop = report.is_noop(),
            elapsed_ms = report.duration.as_millis() as u64,
            "run finished"
        );
        Ok(report)
    }

    /// Publish `window` on its own. A window that already has a publish
    /// record yields [`PipelineError::AlreadyPublished`] unless `force`.
    pub async fn publish(&self, window: &Window, force: bool) -> Result<PublishReceipt> {
        let report = self.run(window, &[Step::Publish], force).await?;
        match report.outcome(Step::Publish) {
            Some(StageOutcome::AlreadyPublished(receipt)) => Err(PipelineError::AlreadyPublished {
                window_id: window.id.clone(),
                receipt: receipt.clone(),
            }),
            _ => self.state.publish_receipt(&window.id).await?.ok_or_else(|| {
                PipelineError::Config(format!("window {} has no publish record", window.id))
            }),
        }
    }

    /// Renew the lease until the run finishes. Returns only once the window
    /// has been lost to another run.
    async fn keep_lease(&self, lock: &WindowLock) -> PipelineError {
        let period = (self.settings.lease / 3)
            .to_std()
            .unwrap_or_default()
            .max(std::time::Duration::from_millis(10));
        loop {
            tokio::time::sleep(period).await;
            match self.state.renew_lock(lock, self.settings.lease).await {
                Ok(expires_at) => debug!(window_id = %lock.window_id, %expires_at, "window lease renewed"),
                Err(err @ PipelineError::LockContention { .. }) => {
                    error!(window_id = %lock.window_id, error = %err, "window lease lost");
                    return err;
                }
                Err(err) => warn!(window_id = %lock.window_id, error = %err, "window lease renewal failed"),
            }
        }
    }

    async fn run_locked(&self, window: &Window, steps: &[Step], force: bool, lock: &WindowLock) -> Result<RunReport> {
        let status = self.state.ensure_window(window).await?;
        let mut completed = status.completed;

        let mut steps = steps.to_vec();
        steps.sort();
        steps.dedup();

        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            self.state.renew_lock(lock, self.settings.lease).await?;

            if step == Step::Publish && !force {
                if let Some(receipt) = self.state.publish_receipt(&window.id).await? {
                    info!(window_id = %window.id, published_at = %receipt.published_at, "window already published");
                    outcomes.push((step, StageOutcome::AlreadyPublished(receipt)));
                    continue;
                }
            }

            if completed.reached(step.target()) && !force {
                debug!(window_id = %window.id, stage = step.as_str(), "stage already completed");
                outcomes.push((step, StageOutcome::Skipped));
                continue;
            }

            if !completed.reached(step.requires()) {
                return Err(PipelineError::StageOrder {
                    stage: step.to_string(),
                    required: step.requires().to_string(),
                    current: completed.to_string(),
                });
            }

            let stage_started = Instant::now();
            info!(window_id = %window.id, stage = step.as_str(), "stage started");

            match self.execute(window, step, force, lock).await {
                Ok(stats) => {
                    if !completed.reached(step.target()) {
                        completed = step.target();
                    }
                    info!(
                        window_id = %window.id,
                        stage = step.as_str(),
                        processed = stats.processed,
                        reused = stats.reused,
                        skipped = stats.skipped,
                        elapsed_ms = stage_started.elapsed().as_millis() as u64,
                        "stage completed"
                    );
                    outcomes.push((step, StageOutcome::Completed(stats)));
                }
                Err(PipelineError::AlreadyPublished { receipt, .. }) => {
                    warn!(window_id = %window.id, published_at = %receipt.published_at, "window was published by another run");
                    outcomes.push((step, StageOutcome::AlreadyPublished(receipt)));
                }
                Err(err @ PipelineError::LockContention { .. }) => {
                    error!(window_id = %window.id, stage = step.as_str(), error = %err, "window lock lost");
                    return Err(err);
                }
                Err(err) => {
                    error!(window_id = %window.id, stage = step.as_str(), error = %err, "stage failed");
                    if let Err(mark_err) = self.state.mark_failed(&window.id, &err.to_string()).await {
                        warn!(window_id = %window.id, error = %mark_err, "could not record stage failure");
                    }
                    return Err(err);
                }
            }
        }

        Ok(RunReport {
            window: window.clone(),
            outcomes,
            completed,
            duration: std::time::Duration::ZERO,
        })
    }

    async fn execute(&self, window: &Window, step: Step, force: bool, lock: &WindowLock) -> Result<StageStats> {
        match step {
            Step::Ingest => self.ingest(window, lock).await,
            Step::Summarize => self.summarize(window, force, lock).await,
            Step::Embed => self.embed(window, force, lock).await,
            Step::Dedup => self.dedup(window, lock).await,
            Step::Publish => self.publish_digest(window, force, lock).await,
        }
    }

    async fn commit_stage(&self, window: &Window, stage: Stage, lock: &WindowLock) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        WindowStateStore::renew_lock_in_tx(&mut tx, lock, self.settings.lease).await?;
        WindowStateStore::advance_in_tx(&mut tx, &window.id, stage).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn ingest(&self, window: &Window, lock: &WindowLock) -> Result<StageStats> {
        let source = &self.collaborators.source;
        let raw = self
            .settings
            .retry
            .run(source.name(), || source.fetch(window))
            .await
            .map_err(|(err, attempts)| PipelineError::from_provider(err, attempts))?;

        let mut stats = StageStats::default();
        let mut tx = self.pool().begin().await?;
        for raw_item in raw {
            if !window.contains(raw_item.posted_at) {
                debug!(item_id = %raw_item.id, posted_at = %raw_item.posted_at, "item outside window, dropped");
                stats.skipped += 1;
                continue;
            }
            if raw_item.id.trim().is_empty() || raw_item.channel.trim().is_empty() {
                skip_item(&mut stats, &raw_item.id, "missing id or channel");
                continue;
            }

            let item = item_from_raw(window, raw_item);
            if store::upsert_item(&mut tx, &item).await? {
                stats.processed += 1;
            } else {
                stats.reused += 1;
            }
        }
        WindowStateStore::renew_lock_in_tx(&mut tx, lock, self.settings.lease).await?;
        WindowStateStore::advance_in_tx(&mut tx, &window.id, Stage::Ingested).await?;
        tx.commit().await?;

        Ok(stats)
    }

    async fn summarize(&self, window: &Window, force: bool, lock: &WindowLock) -> Result<StageStats> {
        let mut stats = StageStats::default();

        if self.settings.mark_exact_duplicates {
            let items = store::items_in_window(self.pool(), &window.id).await?;
            let groups = ExactDedupIndex::group(&items);
            let mut tx = self.pool().begin().await?;
            stats.duplicates_flagged = ExactDedupIndex::mark_duplicates(&mut tx, &window.id, &groups).await?;
            tx.commit().await?;
        }

        let Some(summarizer) = self.collaborators.summarizer.as_ref() else {
            info!(window_id = %window.id, "summarization disabled, stage recorded without work");
            stats.provider_disabled = true;
            self.commit_stage(window, Stage::Summarized, lock).await?;
            return Ok(stats);
        };

        let targets = if force {
            with_text(store::items_in_window(self.pool(), &window.id).await?)
        } else {
            store::items_missing_summary(self.pool(), &window.id).await?
        };

        for item in &targets {
            if let Some(canonical) = item.duplicate_of.as_deref() {
                if let Some(summary) = store::summary_for(self.pool(), canonical).await? {
                    let mut conn = self.pool().acquire().await?;
                    store::save_summary(&mut conn, &item.id, &summary, Some(canonical)).await?;
                    stats.reused += 1;
                    continue;
                }
            }

            let result = self
                .settings
                .retry
                .run(summarizer.model_name(), || summarizer.summarize(&item.normalized_text))
                .await;

            match result {
                Ok(summary) if summary.summary.trim().is_empty() => {
                    skip_item(&mut stats, &item.id, "empty summary");
                }
                Ok(summary) => {
                    let mut conn = self.pool().acquire().await?;
                    store::save_summary(&mut conn, &item.id, &summary, None).await?;
                    stats.processed += 1;
                }
                Err((err, attempts)) => provider_failure(&mut stats, &item.id, err, attempts)?,
            }
        }

        self.commit_stage(window, Stage::Summarized, lock).await?;
        Ok(stats)
    }

    async fn embed(&self, window: &Window, force: bool, lock: &WindowLock) -> Result<StageStats> {
        let mut stats = StageStats::default();

        let Some(embedder) = self.collaborators.embedder.as_ref() else {
            info!(window_id = %window.id, "embeddings disabled, stage recorded without work");
            stats.provider_disabled = true;
            self.commit_stage(window, Stage::Embedded, lock).await?;
            return Ok(stats);
        };

        let items = store::items_in_window(self.pool(), &window.id).await?;
        let mut known: HashMap<String, Vec<f32>> = HashMap::new();
        if !force {
            for item in &items {
                if let Some(embedding) = &item.embedding {
                    known.insert(item.id.clone(), embedding.clone());
                }
            }
        }

        let targets = if force {
            with_text(items)
        } else {
            store::items_missing_embedding(self.pool(), &window.id).await?
        };

        let dims = embedder.dims();
        for item in &targets {
            if let Some(vector) = item.duplicate_of.as_deref().and_then(|c| known.get(c)).cloned() {
                let mut conn = self.pool().acquire().await?;
                store::set_embedding(&mut conn, &item.id, &vector).await?;
                known.insert(item.id.clone(), vector);
                stats.reused += 1;
                continue;
            }

            let result = self
                .settings
                .retry
                .run(embedder.model_name(), || embedder.embed(&item.normalized_text))
                .await;

            match result {
                Ok(vector) => {
                    if let Err(reason) = validate_embedding(&vector, dims) {
                        skip_item(&mut stats, &item.id, &reason);
                        continue;
                    }
                    let mut conn = self.pool().acquire().await?;
                    store::set_embedding(&mut conn, &item.id, &vector).await?;
                    known.insert(item.id.clone(), vector);
                    stats.processed += 1;
                }
                Err((err, attempts)) => provider_failure(&mut stats, &item.id, err, attempts)?,
            }
        }

        self.commit_stage(window, Stage::Embedded, lock).await?;
        Ok(stats)
    }

    async fn dedup(&self, window: &Window, lock: &WindowLock) -> Result<StageStats> {
        let items = store::items_in_window(self.pool(), &window.id).await?;
        let groups = ExactDedupIndex::group(&items);

        let mut tx = self.pool().begin().await?;
        let duplicates_flagged = if self.settings.mark_exact_duplicates {
            ExactDedupIndex::mark_duplicates(&mut tx, &window.id, &groups).await?
        } else {
            0
        };
        let (_, dedup) = self.clusterer.cluster(&mut tx, &window.id, &items, &groups).await?;
        WindowStateStore::renew_lock_in_tx(&mut tx, lock, self.settings.lease).await?;
        WindowStateStore::advance_in_tx(&mut tx, &window.id, Stage::Deduped).await?;
        tx.commit().await?;

        info!(
            window_id = %window.id,
            clusters = dedup.clusters_created,
            assigned = dedup.items_assigned,
            skipped_no_embedding = dedup.skipped_no_embedding,
            exact_groups = groups.len(),
            largest = dedup.largest_cluster,
            average = dedup.average_cluster_size,
            "dedup stats"
        );

        Ok(StageStats {
            processed: dedup.items_assigned,
            skipped: dedup.skipped_no_embedding,
            duplicates_flagged,
            dedup: Some(dedup),
            ..StageStats::default()
        })
    }

    async fn publish_digest(&self, window: &Window, force: bool, lock: &WindowLock) -> Result<StageStats> {
        let items = store::items_in_window(self.pool(), &window.id).await?;
        let clusters = store::clusters_for_window(self.pool(), &window.id).await?;
        let summaries = store::summaries_for_window(self.pool(), &window.id).await?;
        let content = assemble_digest(window, &items, &clusters, &summaries);

        let publisher = &self.collaborators.publisher;
        let message_ids = self
            .settings
            .retry
            .run(publisher.name(), || publisher.publish(window, &content))
            .await
            .map_err(|(err, attempts)| PipelineError::from_provider(err, attempts))?;

        let receipt = PublishReceipt {
            window_id: window.id.clone(),
            message_ids: message_ids.clone(),
            published_at: Utc::now(),
        };
        let stats_json = serde_json::json!({
            "items": items.len(),
            "clusters": clusters.len(),
            "entries": content.entries.len(),
            "unclustered": content.unclustered.len(),
        })
        .to_string();

        let mut tx = self.pool().begin().await?;
        WindowStateStore::renew_lock_in_tx(&mut tx, lock, self.settings.lease).await?;
        if !force {
            if let Some(existing) = WindowStateStore::publish_receipt_in_tx(&mut tx, &window.id).await? {
                return Err(PipelineError::AlreadyPublished {
                    window_id: window.id.clone(),
                    receipt: existing,
                });
            }
        }
        WindowStateStore::record_publish_in_tx(&mut tx, &receipt, &serde_json::to_string(&content)?, &stats_json)
            .await?;
        WindowStateStore::advance_in_tx(&mut tx, &window.id, Stage::Published).await?;
        tx.commit().await?;

        Ok(StageStats {
            processed: content.entries.len() + content.unclustered.len(),
            message_ids,
            ..StageStats::default()
        })
    }
}

fn item_from_raw(window: &Window, raw: RawItem) -> Item {
    let normalized = normalize_text(&raw.text);
    let hash = content_hash(&normalized, raw.has_media, raw.posted_at, raw.permalink.as_deref());
    Item {
        id: raw.id,
        window_id: window.id.clone(),
        channel: raw.channel,
        content_hash: hash,
        normalized_text: normalized,
        has_media: raw.has_media,
        posted_at: raw.posted_at,
        permalink: raw.permalink,
        embedding: None,
        duplicate_of: None,
    }
}

fn with_text(items: Vec<Item>) -> Vec<Item> {
    items.into_iter().filter(|i| !i.normalized_text.is_empty()).collect()
}

fn skip_item(stats: &mut StageStats, item_id: &str, reason: &str) {
    let err = PipelineError::DataIntegrity {
        item_id: item_id.to_string(),
        reason: reason.to_string(),
    };
    warn!(error = %err, "item skipped");
    stats.skipped += 1;
}

/// Transient errors that survived the retry budget fail the stage; anything
/// else only skips the item.
fn provider_failure(stats: &mut StageStats, item_id: &str, err: ProviderError, attempts: u32) -> Result<()> {
    if err.is_transient() {
        return Err(PipelineError::from_provider(err, attempts));
    }
    warn!(item_id, error = %err, "provider rejected item, skipped");
    stats.skipped += 1;
    Ok(())
}
