//! Logging setup shared by the Pagecast binaries
//!
//! Both binaries log to stderr so stdout stays free for command output. The
//! daemon logs at `info` with timestamps; the page CLI stays at `warn` and
//! drops timestamps unless asked otherwise. `RUST_LOG` always wins, then
//! `PAGECAST_LOG_LEVEL`, then the binary's default. `PAGECAST_LOG_FORMAT`
//! picks text, JSON or pretty output.
//!
//! ```no_run
//! use libpagecast::logging::{LogFormat, LoggingConfig, Profile};
//!
//! LoggingConfig::new(Profile::Daemon, false)
//!     .with_format(LogFormat::Json)
//!     .init();
//! ```

use std::str::FromStr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain text, no colors
    Text,
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line and colored, for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

/// Which binary is logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// `pagecast-send`: progress of every tick and publish
    Daemon,
    /// `pagecast-pages`: only problems, the command prints its own results
    Cli,
}

impl Profile {
    fn default_level(self) -> &'static str {
        match self {
            Profile::Daemon => "info",
            Profile::Cli => "warn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub profile: Profile,
    pub format: LogFormat,
    pub level: String,
    /// Forces `debug` regardless of `level`
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(profile: Profile, verbose: bool) -> Self {
        Self {
            profile,
            format: LogFormat::Text,
            level: profile.default_level().to_string(),
            verbose,
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    fn filter(&self) -> EnvFilter {
        let level = if self.verbose { "debug" } else { self.level.as_str() };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }

    /// Install the global subscriber. Returns false when one was already
    /// installed, which leaves the existing one in place.
    pub fn init(&self) -> bool {
        let filter = self.filter();
        let timestamps = self.profile == Profile::Daemon;

        let installed = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .flatten_event(true)
                .with_current_span(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_file(true)
                .with_line_number(true)
                .try_init(),
            LogFormat::Text if timestamps => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .without_time()
                .try_init(),
        };
        installed.is_ok()
    }
}

/// Settings for `profile`, overridden by `PAGECAST_LOG_FORMAT` and
/// `PAGECAST_LOG_LEVEL`. An unparseable format falls back to text.
pub fn from_env(profile: Profile, verbose: bool) -> LoggingConfig {
    let mut config = LoggingConfig::new(profile, verbose);

    if let Some(format) = std::env::var("PAGECAST_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
    {
        config = config.with_format(format);
    }
    if let Ok(level) = std::env::var("PAGECAST_LOG_LEVEL") {
        if !level.trim().is_empty() {
            config = config.with_level(level);
        }
    }
    config
}

/// Daemon logging, configured from the environment
pub fn init_default(verbose: bool) {
    from_env(Profile::Daemon, verbose).init();
}

/// CLI logging, configured from the environment
pub fn init_cli(verbose: bool) {
    from_env(Profile::Cli, verbose).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml"
            .parse::<LogFormat>()
            .unwrap_err()
            .contains("Invalid log format: 'xml'"));
    }

    #[test]
    fn test_profiles_pick_their_level() {
        assert_eq!(LoggingConfig::new(Profile::Daemon, false).level, "info");
        assert_eq!(LoggingConfig::new(Profile::Cli, false).level, "warn");
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_profile() {
        std::env::set_var("PAGECAST_LOG_FORMAT", "json");
        std::env::set_var("PAGECAST_LOG_LEVEL", "error");

        let config = from_env(Profile::Daemon, false);

        std::env::remove_var("PAGECAST_LOG_FORMAT");
        std::env::remove_var("PAGECAST_LOG_LEVEL");

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "error");
        assert_eq!(config.profile, Profile::Daemon);
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_bad_values() {
        std::env::set_var("PAGECAST_LOG_FORMAT", "xml");
        std::env::set_var("PAGECAST_LOG_LEVEL", " ");

        let config = from_env(Profile::Cli, true);

        std::env::remove_var("PAGECAST_LOG_FORMAT");
        std::env::remove_var("PAGECAST_LOG_LEVEL");

        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "warn");
        assert!(config.verbose);
    }

    #[test]
    #[serial]
    fn test_second_init_keeps_first_subscriber() {
        let config = LoggingConfig::new(Profile::Cli, false);
        config.init();
        assert!(!config.init());
    }
}
