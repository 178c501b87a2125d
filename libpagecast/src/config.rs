//! Configuration management for Pagecast
//!
//! Every section has defaults, so a config file only needs the values that
//! differ. The surface password can be kept out of the file with
//! `PAGECAST_SURFACE_PASSWORD`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub tokens: TokensConfig,
    pub scheduling: SchedulingConfig,
    pub retry: RetryConfig,
    pub media: MediaConfig,
    pub surface: SurfaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/pagecast/posts.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensConfig {
    /// Persisted token cache (flat JSON document)
    pub path: String,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/pagecast/tokens.json".to_string(),
        }
    }
}

impl TokensConfig {
    pub fn expand_path(&self) -> PathBuf {
        expand(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Seconds between polls
    pub poll_interval: u64,
    /// Upper bound on publish targets running at once
    pub max_concurrent_publishes: usize,
    /// Seconds past `scheduled_at` a post with only retryable failures stays scheduled
    pub grace_period: i64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            max_concurrent_publishes: 4,
            grace_period: 3600,
        }
    }
}

impl SchedulingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Seconds allowed for downloading a remote image
    pub fetch_timeout: u64,
    pub max_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: 30,
            max_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Root that relative `login_url` and `page_url` values resolve against
    pub base_url: String,
    /// Absolute, or a path under `base_url`
    pub login_url: String,
    /// Page URL template, `{page_id}` is substituted. Absolute, or a path
    /// under `base_url`.
    pub page_url: String,
    pub headless: bool,
    pub user_agent: String,
    /// Header carrying the per-page access token on every request
    pub auth_header: String,
    /// Seconds
    pub navigation_timeout: u64,
    /// Seconds
    pub element_timeout: u64,
    /// Seconds
    pub two_factor_timeout: u64,
    /// URL patterns blocked on the control channel
    pub blocked_resources: Vec<String>,
    pub account_email: Option<String>,
    pub account_password: Option<String>,
    pub selectors: Selectors,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.facebook.com".to_string(),
            login_url: "/login".to_string(),
            page_url: "/{page_id}".to_string(),
            headless: true,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0 Safari/537.36"
                .to_string(),
            auth_header: "Authorization".to_string(),
            navigation_timeout: 30,
            element_timeout: 10,
            two_factor_timeout: 60,
            blocked_resources: vec![
                "*.png".to_string(),
                "*.jpg".to_string(),
                "*.gif".to_string(),
                "*.woff".to_string(),
                "*.woff2".to_string(),
                "*.css".to_string(),
            ],
            account_email: None,
            account_password: None,
            selectors: Selectors::default(),
        }
    }
}

impl SurfaceConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.element_timeout)
    }

    pub fn two_factor_timeout(&self) -> Duration {
        Duration::from_secs(self.two_factor_timeout)
    }

    pub fn login_location(&self) -> String {
        self.resolve(&self.login_url)
    }

    pub fn page_url_for(&self, page_id: &str) -> String {
        self.resolve(&self.page_url.replace("{page_id}", page_id))
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("https://") || url.starts_with("http://") {
            return url.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }

    /// Account password, preferring `PAGECAST_SURFACE_PASSWORD` over the file
    pub fn resolve_password(&self) -> Option<String> {
        std::env::var("PAGECAST_SURFACE_PASSWORD")
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| self.account_password.clone())
    }
}

/// CSS selectors for every element the automation touches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub email_input: String,
    pub password_input: String,
    pub login_button: String,
    pub logged_in_marker: String,
    pub two_factor_prompt: String,
    pub two_factor_input: String,
    pub two_factor_submit: String,
    pub admin_marker: String,
    pub composer_open: String,
    pub composer_text: String,
    pub media_input: String,
    pub schedule_toggle: String,
    pub schedule_date: String,
    pub schedule_time: String,
    pub publish_button: String,
    pub published_marker: String,
    pub comment_input: String,
    pub comment_submit: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            email_input: "input[name='email']".to_string(),
            password_input: "input[name='pass']".to_string(),
            login_button: "button[name='login']".to_string(),
            logged_in_marker: "[aria-label='Your profile']".to_string(),
            two_factor_prompt: "#approvals_code, form[action*='checkpoint']".to_string(),
            two_factor_input: "#approvals_code".to_string(),
            two_factor_submit: "#checkpointSubmitButton".to_string(),
            admin_marker: "[aria-label='Manage Page'], [aria-label='Edit Page']".to_string(),
            composer_open: "[aria-label='Create post']".to_string(),
            composer_text: "div[role='dialog'] div[contenteditable='true']".to_string(),
            media_input: "div[role='dialog'] input[type='file']".to_string(),
            schedule_toggle: "[aria-label='Scheduling options']".to_string(),
            schedule_date: "input[aria-label='Date']".to_string(),
            schedule_time: "input[aria-label='Time']".to_string(),
            publish_button: "div[role='dialog'] [aria-label='Post']".to_string(),
            published_marker: "[role='article']".to_string(),
            comment_input: "[role='article'] div[contenteditable='true']".to_string(),
            comment_submit: "[role='article'] [aria-label='Comment']".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduling.poll_interval == 0 {
            return Err(invalid("scheduling.poll_interval", "must be at least 1 second"));
        }
        if self.scheduling.max_concurrent_publishes == 0 {
            return Err(invalid("scheduling.max_concurrent_publishes", "must be at least 1"));
        }
        if self.scheduling.grace_period < 0 {
            return Err(invalid("scheduling.grace_period", "must not be negative"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.surface.base_url.trim().is_empty() {
            return Err(ConfigError::MissingField("surface.base_url".to_string()).into());
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::PagecastError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Resolve the configuration file path following XDG conventions
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("PAGECAST_CONFIG") {
        return Ok(expand(&path));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("pagecast").join("config.toml"))
}
