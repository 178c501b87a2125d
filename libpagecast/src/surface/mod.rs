//! Low-level automation of the publishing surface
//!
//! A [`SurfaceDriver`] exposes the handful of selector-driven primitives the
//! publish workflow needs. It knows nothing about posts, pages or login; that
//! logic lives in [`crate::session::browser`]. Keeping the driver this thin
//! means the headless browser can be swapped for [`mock::MockDriver`] in tests.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::config::SurfaceConfig;
use crate::error::PublishError;

#[cfg(feature = "chrome")]
pub mod chrome;

// Available in all builds so integration tests can script the surface
pub mod mock;

/// Settings applied when a driver opens its browsing context
#[derive(Clone)]
pub struct DriverOptions {
    pub headless: bool,
    pub user_agent: String,
    pub navigation_timeout: Duration,
    pub element_timeout: Duration,
    /// URL patterns blocked on the control channel
    pub blocked_resources: Vec<String>,
    /// Headers sent with every request, e.g. the page access token
    pub extra_headers: Vec<(String, String)>,
}

impl DriverOptions {
    pub fn from_surface(surface: &SurfaceConfig) -> Self {
        Self {
            headless: surface.headless,
            user_agent: surface.user_agent.clone(),
            navigation_timeout: surface.navigation_timeout(),
            element_timeout: surface.element_timeout(),
            blocked_resources: surface.blocked_resources.clone(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}

impl std::fmt::Debug for DriverOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Header values carry credentials
        let headers: Vec<&str> = self.extra_headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("DriverOptions")
            .field("headless", &self.headless)
            .field("user_agent", &self.user_agent)
            .field("navigation_timeout", &self.navigation_timeout)
            .field("element_timeout", &self.element_timeout)
            .field("blocked_resources", &self.blocked_resources)
            .field("extra_headers", &headers)
            .finish()
    }
}

/// Selector-driven automation primitives.
///
/// Errors from the interaction methods are [`PublishError::TransientSurfaceError`]
/// unless the driver knows better; `open` failures are
/// [`PublishError::SessionInitFailed`].
#[async_trait]
pub trait SurfaceDriver: Send + Sync {
    /// Create the browsing context and apply `options`
    async fn open(&mut self, options: &DriverOptions) -> Result<(), PublishError>;

    /// Load `url` and wait for the navigation to settle
    async fn navigate(&self, url: &str) -> Result<(), PublishError>;

    /// Wait until `selector` matches, failing after `timeout`
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), PublishError>;

    /// Whether `selector` matches right now, without waiting
    async fn exists(&self, selector: &str) -> Result<bool, PublishError>;

    async fn click(&self, selector: &str) -> Result<(), PublishError>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PublishError>;

    /// Attach a local file to the file input matched by `selector`
    async fn upload_file(&self, selector: &str, path: &Path) -> Result<(), PublishError>;

    /// Accept any open JavaScript dialog. A no-op when none is showing.
    async fn accept_dialogs(&self) -> Result<(), PublishError>;

    /// Release the browsing context. Safe to call more than once.
    async fn close(&mut self) -> Result<(), PublishError>;
}
