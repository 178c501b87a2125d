//! Pagecast - scheduled publishing to pages on an automation-driven surface
//!
//! This library holds the publishing pipeline: the polling [`Scheduler`],
//! the per-target [`PublishExecutor`], publish sessions over a browser
//! driver, the per-page [`TokenStore`] and the fixed-delay [`RetryPolicy`].

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod logging;
pub mod media;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod surface;
pub mod tokens;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, PostStore};
pub use error::{PagecastError, PublishError, Result};
pub use executor::PublishExecutor;
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use tokens::{Credential, TokenStore};
pub use types::{ImageRef, Page, Post, PostStatus, PublishOutcome, Target, TargetState};
