//! Core types for Pagecast

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PagecastError;

/// Lifecycle of a post as seen by the pipeline.
///
/// `draft` is never touched by the pipeline; `published` and `failed` are
/// terminal from its point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }
}

impl FromStr for PostStatus {
    type Err = PagecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(PagecastError::InvalidInput(format!(
                "Unknown post status: '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image attached to a post: a remote reference or raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageRef {
    Url(String),
    Blob(Vec<u8>),
}

/// A page a post can be published to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    /// External page id on the publishing surface
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl Page {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_url: None,
        }
    }
}

/// Persisted state of one (post, page) target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Pending,
    Published,
    Failed,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Pending => "pending",
            TargetState::Published => "published",
            TargetState::Failed => "failed",
        }
    }
}

impl FromStr for TargetState {
    type Err = PagecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TargetState::Pending),
            "published" => Ok(TargetState::Published),
            "failed" => Ok(TargetState::Failed),
            other => Err(PagecastError::InvalidInput(format!(
                "Unknown target state: '{}'",
                other
            ))),
        }
    }
}

/// One independent publish target of a post
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub page: Page,
    pub state: TargetState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub content: String,
    pub first_comment: Option<String>,
    pub image: Option<ImageRef>,
    /// Unix timestamp (seconds) the post is due at
    pub scheduled_at: i64,
    /// When set, the post is scheduled inside the surface for this time
    /// instead of going live when the pipeline runs it.
    pub surface_publish_at: Option<i64>,
    pub status: PostStatus,
    pub error: Option<String>,
    /// Ordered publish targets
    pub targets: Vec<Target>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    /// Create a scheduled post for the given pages
    pub fn scheduled(content: impl Into<String>, scheduled_at: i64, pages: Vec<Page>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            first_comment: None,
            image: None,
            scheduled_at,
            surface_publish_at: None,
            status: PostStatus::Scheduled,
            error: None,
            targets: pages
                .into_iter()
                .map(|page| Target {
                    page,
                    state: TargetState::Pending,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the post is due at `now`
    pub fn is_due(&self, now: i64) -> bool {
        self.status == PostStatus::Scheduled && self.scheduled_at <= now
    }
}

/// Result of publishing a post to one page. Not persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    RetryableFailure { reason: String },
    TerminalFailure { reason: String },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PublishOutcome::Published => None,
            PublishOutcome::RetryableFailure { reason }
            | PublishOutcome::TerminalFailure { reason } => Some(reason),
        }
    }
}
