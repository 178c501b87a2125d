//! Error types for Pagecast

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PagecastError>;

#[derive(Error, Debug)]
pub enum PagecastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Token store error: {0}")]
    TokenStore(#[from] TokenStoreError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PagecastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PagecastError::InvalidInput(_) => 3,
            PagecastError::Publish(PublishError::AuthenticationFailed(_))
            | PagecastError::Publish(PublishError::CredentialExpired(_)) => 2,
            PagecastError::Publish(_) => 1,
            PagecastError::Config(_) => 1,
            PagecastError::Database(_) => 1,
            PagecastError::TokenStore(_) => 1,
            PagecastError::Io(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum TokenStoreError {
    #[error("Failed to write token cache {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize token cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures raised while publishing one target.
///
/// Cloneable so the retry loop can hand the last error back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("credential-expired: no valid access token for page {0}")]
    CredentialExpired(String),

    #[error("Session initialization failed: {0}")]
    SessionInitFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Two-factor approval timed out after {}s", .0.as_secs())]
    TwoFactorTimeout(Duration),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Compose failed: {0}")]
    ComposeFailed(String),

    #[error("Confirm failed: {0}")]
    ConfirmFailed(String),

    #[error("Transient surface error: {0}")]
    TransientSurfaceError(String),
}

impl PublishError {
    /// Whether retrying the same step locally can plausibly succeed.
    ///
    /// Credential, authentication, access and two-factor errors escalate
    /// immediately without consuming retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PublishError::SessionInitFailed(_)
                | PublishError::ComposeFailed(_)
                | PublishError::ConfirmFailed(_)
                | PublishError::TransientSurfaceError(_)
        )
    }

    /// Whether the failure is final for the post, not just for this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PublishError::AuthenticationFailed(_) | PublishError::AccessDenied(_)
        )
    }

    /// Stable name of the error category
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::CredentialExpired(_) => "CredentialExpired",
            PublishError::SessionInitFailed(_) => "SessionInitFailed",
            PublishError::AuthenticationFailed(_) => "AuthenticationFailed",
            PublishError::TwoFactorTimeout(_) => "TwoFactorTimeout",
            PublishError::AccessDenied(_) => "AccessDenied",
            PublishError::ComposeFailed(_) => "ComposeFailed",
            PublishError::ConfirmFailed(_) => "ConfirmFailed",
            PublishError::TransientSurfaceError(_) => "TransientSurfaceError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = PagecastError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_errors() {
        let auth = PagecastError::Publish(PublishError::AuthenticationFailed("bad".to_string()));
        assert_eq!(auth.exit_code(), 2);

        let expired = PagecastError::Publish(PublishError::CredentialExpired("p1".to_string()));
        assert_eq!(expired.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_errors() {
        let denied = PagecastError::Publish(PublishError::AccessDenied("p1".to_string()));
        assert_eq!(denied.exit_code(), 1);

        let config = PagecastError::Config(ConfigError::MissingField("surface.base_url".into()));
        assert_eq!(config.exit_code(), 1);

        let db = PagecastError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        )));
        assert_eq!(db.exit_code(), 1);

        let signals: PagecastError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "signal setup").into();
        assert_eq!(signals.exit_code(), 1);
    }

    #[test]
    fn test_retryable_categories() {
        assert!(PublishError::SessionInitFailed("x".into()).is_retryable());
        assert!(PublishError::ComposeFailed("x".into()).is_retryable());
        assert!(PublishError::ConfirmFailed("x".into()).is_retryable());
        assert!(PublishError::TransientSurfaceError("x".into()).is_retryable());

        assert!(!PublishError::CredentialExpired("x".into()).is_retryable());
        assert!(!PublishError::AuthenticationFailed("x".into()).is_retryable());
        assert!(!PublishError::AccessDenied("x".into()).is_retryable());
        assert!(!PublishError::TwoFactorTimeout(Duration::from_secs(60)).is_retryable());
    }

    #[test]
    fn test_terminal_categories() {
        assert!(PublishError::AuthenticationFailed("x".into()).is_terminal());
        assert!(PublishError::AccessDenied("x".into()).is_terminal());

        // Two-factor timeouts end the run, not the post
        assert!(!PublishError::TwoFactorTimeout(Duration::from_secs(60)).is_terminal());
        assert!(!PublishError::CredentialExpired("x".into()).is_terminal());
        assert!(!PublishError::ConfirmFailed("x".into()).is_terminal());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = PagecastError::Publish(PublishError::AccessDenied(
            "page 42 shows no admin controls".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Publish error: Access denied: page 42 shows no admin controls"
        );

        let timeout = PublishError::TwoFactorTimeout(Duration::from_secs(60));
        assert_eq!(timeout.to_string(), "Two-factor approval timed out after 60s");
    }

    #[test]
    fn test_credential_expired_message_carries_reason_tag() {
        let error = PublishError::CredentialExpired("page-a".to_string());
        assert!(error.to_string().starts_with("credential-expired"));
        assert_eq!(error.kind(), "CredentialExpired");
    }

    #[test]
    fn test_publish_error_clone() {
        let original = PublishError::TransientSurfaceError("socket closed".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }

    #[test]
    fn test_error_conversion_from_publish_error() {
        let err: PagecastError = PublishError::ComposeFailed("test".to_string()).into();
        assert!(matches!(err, PagecastError::Publish(PublishError::ComposeFailed(_))));
    }
}
