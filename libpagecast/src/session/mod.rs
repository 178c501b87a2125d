//! Publish sessions against the external surface
//!
//! A session is created for one (post, page) target, driven through its
//! state machine by the executor and always torn down afterwards. Sessions
//! are never pooled or shared between tasks.
//!
//! ```text
//! Uninitialized -> Ready -> Authenticated -> OnTarget -> Composed -> Confirmed
//!                     \-> AwaitingTwoFactor -/
//! any state -> Closed
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::error::PublishError;
use crate::tokens::Credential;
use crate::types::Page;

pub mod browser;
pub mod two_factor;

// Mock sessions are available for all builds (not just tests) to support integration tests
pub mod mock;

pub use browser::{BrowserSession, BrowserSessionFactory};
pub use two_factor::{TwoFactorBroker, TwoFactorResolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Authenticated,
    AwaitingTwoFactor,
    OnTarget,
    Composed,
    Confirmed,
    Failed,
    Closed,
}

/// How `login` reached the authenticated state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// A previous session cookie was still valid
    ExistingSession,
    Password,
    /// Password plus a resolved two-factor challenge
    TwoFactor,
}

/// Everything the composer needs for one post
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composition {
    pub content: String,
    /// Staged local copy of the post image
    pub media: Option<PathBuf>,
    /// Submitted after confirmation by `submit_first_comment`
    pub first_comment: Option<String>,
}

#[async_trait]
pub trait PublishSession: Send {
    fn state(&self) -> SessionState;

    /// Create the browsing context. `Uninitialized -> Ready`.
    async fn initialize(&mut self) -> Result<(), PublishError>;

    /// `Ready -> Authenticated`, possibly via `AwaitingTwoFactor`
    async fn login(&mut self) -> Result<LoginOutcome, PublishError>;

    /// Open the page and verify admin access. `Authenticated -> OnTarget`.
    ///
    /// # Errors
    ///
    /// [`PublishError::AccessDenied`] when no admin control is visible.
    async fn navigate_to_target(&mut self, page_id: &str) -> Result<(), PublishError>;

    /// `OnTarget -> Composed`
    async fn compose(&mut self, composition: &Composition) -> Result<(), PublishError>;

    /// Fill the surface's own scheduling fields. Only valid in `Composed`.
    async fn schedule_in_surface(&mut self, publish_at: DateTime<Utc>) -> Result<(), PublishError>;

    /// `Composed -> Confirmed`
    async fn confirm_publish(&mut self) -> Result<(), PublishError>;

    /// Post the composition's first comment under the published post.
    /// A no-op when there is none.
    async fn submit_first_comment(&mut self) -> Result<(), PublishError>;

    /// Release every resource held by the session. `any -> Closed`.
    async fn teardown(&mut self);
}

/// Builds a fresh session for each publish attempt
pub trait SessionFactory: Send + Sync {
    fn create(&self, page: &Page, credential: &Credential) -> Box<dyn PublishSession>;
}

pub(crate) fn out_of_order(step: &str, state: SessionState) -> PublishError {
    PublishError::SessionInitFailed(format!("cannot {} from state {:?}", step, state))
}
