//! Publishing one post to one page
//!
//! The executor owns the per-target workflow: credential check, session
//! setup, media staging, compose, optional in-surface scheduling, confirm and
//! the best-effort first comment. Every step is retried on its own, the
//! session is always torn down and the staged image always removed, and the
//! result is folded into a [`PublishOutcome`].

use chrono::DateTime;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::PublishError;
use crate::media::{MediaFetcher, StagedMedia};
use crate::retry::RetryPolicy;
use crate::session::{Composition, PublishSession, SessionFactory};
use crate::tokens::TokenStore;
use crate::types::{Page, Post, PublishOutcome};

pub struct PublishExecutor {
    tokens: Arc<TokenStore>,
    sessions: Arc<dyn SessionFactory>,
    fetcher: MediaFetcher,
    retry: RetryPolicy,
}

impl PublishExecutor {
    pub fn new(
        tokens: Arc<TokenStore>,
        sessions: Arc<dyn SessionFactory>,
        fetcher: MediaFetcher,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tokens,
            sessions,
            fetcher,
            retry,
        }
    }

    /// Publish `post` to `page` and classify the result. Never panics on
    /// surface errors; every failure becomes an outcome.
    pub async fn publish(&self, post: &Post, page: &Page) -> PublishOutcome {
        let span = info_span!("publish", post_id = %post.id, page_id = %page.id);
        self.publish_inner(post, page).instrument(span).await
    }

    async fn publish_inner(&self, post: &Post, page: &Page) -> PublishOutcome {
        let credential = match self.tokens.get(&page.id).await {
            Some(credential) => credential,
            None => {
                let error = PublishError::CredentialExpired(page.id.clone());
                warn!("{}", error);
                return PublishOutcome::RetryableFailure {
                    reason: error.to_string(),
                };
            }
        };

        let mut session = self.sessions.create(page, &credential);
        let result = self.drive(session.as_mut(), post, page).await;
        session.teardown().await;

        match result {
            Ok(()) => {
                info!("Published");
                PublishOutcome::Published
            }
            Err(e) => classify(&page.id, e),
        }
    }

    async fn drive(
        &self,
        session: &mut dyn PublishSession,
        post: &Post,
        page: &Page,
    ) -> Result<(), PublishError> {
        self.retry
            .execute_on("initialize", &mut *session, |s| {
                Box::pin(async move { s.initialize().await })
            })
            .await?;

        let login = self
            .retry
            .execute_on("login", &mut *session, |s| Box::pin(async move { s.login().await }))
            .await?;
        debug!(?login, "Session authenticated");

        let page_id = page.id.clone();
        self.retry
            .execute_on("navigate", &mut *session, move |s| {
                let page_id = page_id.clone();
                Box::pin(async move { s.navigate_to_target(&page_id).await })
            })
            .await?;

        // Dropped when this function returns, whatever the path
        let staged = match &post.image {
            Some(image) => Some(
                self.retry
                    .execute("stage media", || StagedMedia::stage(image, &self.fetcher))
                    .await?,
            ),
            None => None,
        };

        let composition = Composition {
            content: post.content.clone(),
            media: staged.as_ref().map(|m| m.path().to_path_buf()),
            first_comment: post.first_comment.clone(),
        };
        self.retry
            .execute_on("compose", &mut *session, move |s| {
                let composition = composition.clone();
                Box::pin(async move { s.compose(&composition).await })
            })
            .await?;

        if let Some(at) = post.surface_publish_at {
            let publish_at = DateTime::from_timestamp(at, 0).ok_or_else(|| {
                PublishError::ComposeFailed(format!("invalid surface publish time {}", at))
            })?;
            self.retry
                .execute_on("schedule", &mut *session, move |s| {
                    Box::pin(async move { s.schedule_in_surface(publish_at).await })
                })
                .await?;
            debug!(%publish_at, "Scheduled inside the surface");
        }

        self.retry
            .execute_on("confirm", &mut *session, |s| {
                Box::pin(async move { s.confirm_publish().await })
            })
            .await?;

        if post.first_comment.is_some() {
            let comment = self
                .retry
                .execute_on("first comment", &mut *session, |s| {
                    Box::pin(async move { s.submit_first_comment().await })
                })
                .await;
            if let Err(e) = comment {
                // The post itself is live
                warn!("First comment failed, keeping publish as successful: {}", e);
            }
        }

        Ok(())
    }
}

/// Map an escalated error to an outcome. Only authorization failures end
/// the post; everything else may succeed on a later tick.
fn classify(page_id: &str, error: PublishError) -> PublishOutcome {
    let reason = format!("[{}] {}", page_id, error);
    if error.is_terminal() {
        warn!(kind = error.kind(), "Terminal publish failure: {}", error);
        PublishOutcome::TerminalFailure { reason }
    } else {
        warn!(kind = error.kind(), "Retryable publish failure: {}", error);
        PublishOutcome::RetryableFailure { reason }
    }
}
