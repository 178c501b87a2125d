//! Polling scheduler for due posts
//!
//! Each tick lists posts with `status = scheduled` and `scheduled_at <= now`,
//! claims the ones not already in flight, re-reads each claimed post and
//! spawns one task per post that is still scheduled. A post
//! task publishes every target that has not been published yet, concurrently
//! and bounded by a shared semaphore, records each target's outcome and then
//! writes the rolled-up post status in a single update.
//!
//! Failures stay inside their post task: a store error or panic is logged and
//! the loop keeps polling.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulingConfig;
use crate::db::PostStore;
use crate::error::Result;
use crate::executor::PublishExecutor;
use crate::types::{Post, PostStatus, PublishOutcome, TargetState};

pub struct Scheduler {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    store: Arc<dyn PostStore>,
    executor: Arc<PublishExecutor>,
    grace_period: i64,
    permits: Semaphore,
    in_flight: Mutex<HashSet<String>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn PostStore>,
        executor: Arc<PublishExecutor>,
        config: &SchedulingConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                grace_period: config.grace_period,
                permits: Semaphore::new(config.max_concurrent_publishes.max(1)),
                in_flight: Mutex::new(HashSet::new()),
                tasks: tokio::sync::Mutex::new(JoinSet::new()),
            }),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Start polling every `poll_interval`. The first poll runs immediately.
    pub fn start(&self, poll_interval: Duration) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            warn!("Scheduler already started");
            return;
        }

        info!("Scheduler starting, polling every {}s", poll_interval.as_secs());
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(run_loop(inner, poll_interval, shutdown)));
    }

    /// Stop polling and wait for every in-flight publish to finish (or hit
    /// its own timeouts). Nothing is aborted.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
        }

        let drained = self.inner.drain().await;
        if drained > 0 {
            info!("Waited for {} in-flight post(s)", drained);
        }
        info!("Scheduler stopped");
    }

    /// Run a single tick and wait for every post it dispatched.
    /// Returns how many posts were dispatched.
    pub async fn run_once(&self) -> Result<usize> {
        let dispatched = self.inner.tick().await?;
        self.inner.drain().await;
        Ok(dispatched)
    }

    /// Dispatch due posts without waiting for them
    pub async fn tick(&self) -> Result<usize> {
        self.inner.tick().await
    }

    /// Ids of posts currently being published
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.in_flight().iter().cloned().collect();
        ids.sort();
        ids
    }
}

async fn run_loop(inner: Arc<Inner>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.reap().await;
                match inner.tick().await {
                    Ok(0) => debug!("No posts due"),
                    Ok(n) => info!("Dispatched {} due post(s)", n),
                    Err(e) => error!("Failed to poll for due posts: {}", e),
                }
            }
            _ = shutdown.changed() => {
                info!("Shutdown requested, stopping scheduler loop");
                break;
            }
        }
    }
}

/// Removes a post from the in-flight set when its task ends, panics included
struct InFlightGuard {
    inner: Arc<Inner>,
    post_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.post_id);
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(self: &Arc<Self>, post_id: &str) -> Option<InFlightGuard> {
        if !self.in_flight().insert(post_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            inner: Arc::clone(self),
            post_id: post_id.to_string(),
        })
    }

    async fn tick(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now().timestamp();
        let due = self.store.list_due(now).await?;

        let mut tasks = self.tasks.lock().await;
        let mut dispatched = 0;
        for post in due {
            let Some(guard) = self.claim(&post.id) else {
                debug!(post_id = %post.id, "Post already in flight, skipping");
                continue;
            };

            // The listing can predate the write-back of a task that finished
            // after it was read
            let post = match self.store.get_post(&post.id).await {
                Ok(Some(current)) if current.status == PostStatus::Scheduled => current,
                Ok(_) => {
                    debug!(post_id = %post.id, "Post no longer scheduled, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(post_id = %post.id, "Failed to reload post, skipping: {}", e);
                    continue;
                }
            };

            let inner = Arc::clone(self);
            tasks.spawn(async move {
                let _guard = guard;
                inner.process(post).await;
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Collect finished tasks so the set does not grow between ticks
    async fn reap(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            log_join(result);
        }
    }

    async fn drain(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let mut drained = 0;
        while let Some(result) = tasks.join_next().await {
            log_join(result);
            drained += 1;
        }
        drained
    }

    async fn process(&self, post: Post) {
        let post_id = post.id.clone();
        match self.publish_post(post).await {
            Ok(status) => info!(post_id = %post_id, %status, "Post processed"),
            Err(e) => error!(post_id = %post_id, "Failed to write back post outcome: {}", e),
        }
    }

    async fn publish_post(&self, post: Post) -> Result<PostStatus> {
        if post.targets.is_empty() {
            let reason = "post has no target pages";
            self.store
                .update_status(&post.id, PostStatus::Failed, Some(reason))
                .await?;
            return Ok(PostStatus::Failed);
        }

        // Pages published on an earlier tick are never published again
        let pending: Vec<_> = post
            .targets
            .iter()
            .filter(|t| t.state != TargetState::Published)
            .collect();
        debug!(
            post_id = %post.id,
            "Publishing to {} of {} page(s)",
            pending.len(),
            post.targets.len()
        );

        let post_ref = &post;
        let attempts = pending.iter().map(|&target| async move {
            let _permit = self.permits.acquire().await.ok();
            let outcome = self.executor.publish(post_ref, &target.page).await;
            (target.page.id.as_str(), outcome)
        });
        let outcomes = join_all(attempts).await;

        for (page_id, outcome) in &outcomes {
            self.store.record_target(&post.id, page_id, outcome).await?;
        }

        let past_grace = Utc::now().timestamp() > post.scheduled_at + self.grace_period;
        let outcomes: Vec<PublishOutcome> = outcomes.into_iter().map(|(_, o)| o).collect();
        let (status, error) = rollup(&outcomes, past_grace);

        self.store
            .update_status(&post.id, status, error.as_deref())
            .await?;
        Ok(status)
    }
}

fn log_join(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Post task panicked: {}", e);
        } else {
            warn!("Post task did not complete: {}", e);
        }
    }
}

/// Post-level status from the outcomes of this tick's targets.
///
/// Any terminal failure fails the post with the first terminal reason. All
/// published means published. Otherwise the post stays scheduled, carrying
/// the first retryable reason, until `past_grace`, when it fails with it.
pub fn rollup(outcomes: &[PublishOutcome], past_grace: bool) -> (PostStatus, Option<String>) {
    if let Some(terminal) = outcomes
        .iter()
        .find(|o| matches!(o, PublishOutcome::TerminalFailure { .. }))
    {
        return (PostStatus::Failed, terminal.reason().map(str::to_string));
    }

    let retryable = outcomes.iter().find_map(|o| match o {
        PublishOutcome::RetryableFailure { reason } => Some(reason.clone()),
        _ => None,
    });

    match retryable {
        None => (PostStatus::Published, None),
        Some(reason) if past_grace => (
            PostStatus::Failed,
            Some(format!("gave up after grace period: {}", reason)),
        ),
        Some(reason) => (PostStatus::Scheduled, Some(reason)),
    }
}
