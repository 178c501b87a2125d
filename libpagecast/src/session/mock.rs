//! Mock sessions for testing
//!
//! [`MockSessionFactory`] hands out [`MockSession`]s that share one log, so a
//! test can inspect every session the executor created, which steps ran, what
//! got published and whether each session was torn down. Failures are injected
//! per (page, step), either permanently or for a number of calls, and counters
//! survive across sessions so a page can fail on one tick and recover on the
//! next.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PublishError;
use crate::session::{Composition, LoginOutcome, PublishSession, SessionFactory, SessionState};
use crate::tokens::Credential;
use crate::types::Page;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Initialize,
    Login,
    Navigate,
    Compose,
    Schedule,
    Confirm,
    Comment,
}

#[derive(Debug)]
struct Failure {
    error: PublishError,
    /// Remaining failures, `None` for permanent
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct MockLog {
    failures: HashMap<(String, MockStep), Failure>,
    created: Vec<String>,
    teardowns: Vec<String>,
    calls: Vec<(String, MockStep)>,
    published: Vec<(String, String)>,
    media: Vec<(PathBuf, bool)>,
    scheduled: Vec<(String, DateTime<Utc>)>,
    comments: Vec<(String, String)>,
    active: usize,
    peak: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockSessionFactory {
    log: Arc<Mutex<MockLog>>,
    delay: Duration,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every step sleeps for `delay` first (simulates a slow surface)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `step` always fails with `error` for `page_id`
    pub fn fail(self, page_id: &str, step: MockStep, error: PublishError) -> Self {
        self.inject(page_id, step, error, None);
        self
    }

    /// `step` fails with `error` for the next `times` calls for `page_id`
    pub fn fail_times(self, page_id: &str, step: MockStep, error: PublishError, times: u32) -> Self {
        self.inject(page_id, step, error, Some(times));
        self
    }

    pub fn clear_failures(&self) {
        self.log.lock().unwrap().failures.clear();
    }

    fn inject(&self, page_id: &str, step: MockStep, error: PublishError, remaining: Option<u32>) {
        self.log
            .lock()
            .unwrap()
            .failures
            .insert((page_id.to_string(), step), Failure { error, remaining });
    }

    /// Page ids of every session created, in order
    pub fn created(&self) -> Vec<String> {
        self.log.lock().unwrap().created.clone()
    }

    /// Page ids of every session torn down, in order
    pub fn teardowns(&self) -> Vec<String> {
        self.log.lock().unwrap().teardowns.clone()
    }

    /// (page id, content) of every confirmed publish
    pub fn published(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().published.clone()
    }

    pub fn published_pages(&self) -> Vec<String> {
        self.published().into_iter().map(|(page, _)| page).collect()
    }

    /// Staged media paths and whether each existed when composed
    pub fn media(&self) -> Vec<(PathBuf, bool)> {
        self.log.lock().unwrap().media.clone()
    }

    pub fn scheduled(&self) -> Vec<(String, DateTime<Utc>)> {
        self.log.lock().unwrap().scheduled.clone()
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().comments.clone()
    }

    /// How many times `step` ran for `page_id`, failures included
    pub fn calls(&self, page_id: &str, step: MockStep) -> usize {
        self.log
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(page, s)| page == page_id && *s == step)
            .count()
    }

    /// Most sessions that were initialized and not yet torn down at once
    pub fn peak_concurrency(&self) -> usize {
        self.log.lock().unwrap().peak
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, page: &Page, _credential: &Credential) -> Box<dyn PublishSession> {
        self.log.lock().unwrap().created.push(page.id.clone());
        Box::new(MockSession {
            page_id: page.id.clone(),
            log: Arc::clone(&self.log),
            delay: self.delay,
            state: SessionState::Uninitialized,
            active: false,
            composition: None,
        })
    }
}

pub struct MockSession {
    page_id: String,
    log: Arc<Mutex<MockLog>>,
    delay: Duration,
    state: SessionState,
    active: bool,
    composition: Option<Composition>,
}

impl MockSession {
    async fn step(&mut self, step: MockStep) -> Result<(), PublishError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let mut log = self.log.lock().unwrap();
        log.calls.push((self.page_id.clone(), step));

        let key = (self.page_id.clone(), step);
        if let Some(failure) = log.failures.get_mut(&key) {
            let fails = match failure.remaining.as_mut() {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            };
            if fails {
                let error = failure.error.clone();
                drop(log);
                self.state = SessionState::Failed;
                return Err(error);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PublishSession for MockSession {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn initialize(&mut self) -> Result<(), PublishError> {
        self.step(MockStep::Initialize).await?;
        if !self.active {
            self.active = true;
            let mut log = self.log.lock().unwrap();
            log.active += 1;
            log.peak = log.peak.max(log.active);
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    async fn login(&mut self) -> Result<LoginOutcome, PublishError> {
        self.step(MockStep::Login).await?;
        self.state = SessionState::Authenticated;
        Ok(LoginOutcome::Password)
    }

    async fn navigate_to_target(&mut self, _page_id: &str) -> Result<(), PublishError> {
        self.step(MockStep::Navigate).await?;
        self.state = SessionState::OnTarget;
        Ok(())
    }

    async fn compose(&mut self, composition: &Composition) -> Result<(), PublishError> {
        if let Some(path) = &composition.media {
            self.log
                .lock()
                .unwrap()
                .media
                .push((path.clone(), path.exists()));
        }
        self.step(MockStep::Compose).await?;
        self.composition = Some(composition.clone());
        self.state = SessionState::Composed;
        Ok(())
    }

    async fn schedule_in_surface(&mut self, publish_at: DateTime<Utc>) -> Result<(), PublishError> {
        self.step(MockStep::Schedule).await?;
        self.log
            .lock()
            .unwrap()
            .scheduled
            .push((self.page_id.clone(), publish_at));
        Ok(())
    }

    async fn confirm_publish(&mut self) -> Result<(), PublishError> {
        self.step(MockStep::Confirm).await?;
        let content = self
            .composition
            .as_ref()
            .map(|c| c.content.clone())
            .unwrap_or_default();
        self.log
            .lock()
            .unwrap()
            .published
            .push((self.page_id.clone(), content));
        self.state = SessionState::Confirmed;
        Ok(())
    }

    async fn submit_first_comment(&mut self) -> Result<(), PublishError> {
        let Some(comment) = self
            .composition
            .as_ref()
            .and_then(|c| c.first_comment.clone())
        else {
            return Ok(());
        };
        self.step(MockStep::Comment).await?;
        self.log
            .lock()
            .unwrap()
            .comments
            .push((self.page_id.clone(), comment));
        self.state = SessionState::Confirmed;
        Ok(())
    }

    async fn teardown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let mut log = self.log.lock().unwrap();
        if self.active {
            log.active -= 1;
            self.active = false;
        }
        log.teardowns.push(self.page_id.clone());
        drop(log);
        self.state = SessionState::Closed;
    }
}
