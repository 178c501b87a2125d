//! Selector-driven publish session on top of a [`SurfaceDriver`]
//!
//! Every interaction that touches the surface (navigation, element waits,
//! clicks, typing, uploads) is retried individually so one flaky element does
//! not restart the whole workflow. Open dialogs are accepted before every
//! attempt, so a dialog raised in any state cannot block the next step, and
//! again after each action that tends to raise one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SurfaceConfig;
use crate::error::PublishError;
use crate::retry::RetryPolicy;
use crate::session::{
    out_of_order, Composition, LoginOutcome, PublishSession, SessionFactory, SessionState,
    TwoFactorBroker, TwoFactorResolution,
};
use crate::surface::{DriverOptions, SurfaceDriver};
use crate::tokens::Credential;
use crate::types::Page;

/// How often the two-factor prompt is checked for disappearing
const TWO_FACTOR_POLL: Duration = Duration::from_millis(500);

const SCHEDULE_DATE_FORMAT: &str = "%m/%d/%Y";
const SCHEDULE_TIME_FORMAT: &str = "%H:%M";

pub type DriverFactory = Arc<dyn Fn() -> Box<dyn SurfaceDriver> + Send + Sync>;

pub struct BrowserSession {
    driver: Box<dyn SurfaceDriver>,
    surface: Arc<SurfaceConfig>,
    options: DriverOptions,
    page_id: String,
    /// Key the two-factor broker knows this session by
    key: String,
    broker: Arc<TwoFactorBroker>,
    retry: RetryPolicy,
    /// Last state reached successfully
    state: SessionState,
    failed: bool,
    first_comment: Option<String>,
}

impl BrowserSession {
    pub fn new(
        driver: Box<dyn SurfaceDriver>,
        surface: Arc<SurfaceConfig>,
        options: DriverOptions,
        page_id: &str,
        broker: Arc<TwoFactorBroker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            driver,
            surface,
            options,
            page_id: page_id.to_string(),
            key: format!("{}/{}", page_id, Uuid::new_v4()),
            broker,
            retry,
            state: SessionState::Uninitialized,
            failed: false,
            first_comment: None,
        }
    }

    /// Key to resolve this session's two-factor challenge with
    pub fn two_factor_key(&self) -> &str {
        &self.key
    }

    fn expect(&self, allowed: &[SessionState], step: &str) -> Result<(), PublishError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(out_of_order(step, self.state()))
        }
    }

    /// Move to `to` on success. On failure the session falls back to `from`
    /// so the step can be retried, and reports `Failed` until then.
    fn settle<T>(
        &mut self,
        from: SessionState,
        result: Result<T, PublishError>,
        to: SessionState,
    ) -> Result<T, PublishError> {
        match result {
            Ok(value) => {
                self.state = to;
                self.failed = false;
                Ok(value)
            }
            Err(e) => {
                warn!(
                    page_id = %self.page_id,
                    state = ?from,
                    kind = e.kind(),
                    "Session step failed: {}",
                    e
                );
                self.state = from;
                self.failed = true;
                Err(e)
            }
        }
    }

    async fn navigate(&self, url: &str) -> Result<(), PublishError> {
        self.retry
            .execute("navigate", move || async move {
                self.dismiss_dialogs().await;
                self.driver.navigate(url).await
            })
            .await?;
        self.dismiss_dialogs().await;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), PublishError> {
        let timeout = self.options.element_timeout;
        self.retry
            .execute("click", move || async move {
                self.dismiss_dialogs().await;
                self.driver.wait_for(selector, timeout).await?;
                self.driver.click(selector).await
            })
            .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PublishError> {
        let timeout = self.options.element_timeout;
        self.retry
            .execute("type", move || async move {
                self.dismiss_dialogs().await;
                self.driver.wait_for(selector, timeout).await?;
                self.driver.type_text(selector, text).await
            })
            .await
    }

    /// Single wait, used where a miss means something other than flakiness
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), PublishError> {
        self.dismiss_dialogs().await;
        self.driver.wait_for(selector, timeout).await
    }

    async fn dismiss_dialogs(&self) {
        if let Err(e) = self.driver.accept_dialogs().await {
            debug!("Failed to accept dialogs: {}", e);
        }
    }

    async fn run_login(&mut self) -> Result<LoginOutcome, PublishError> {
        let surface = Arc::clone(&self.surface);
        let sel = &surface.selectors;

        self.navigate(&surface.login_location()).await?;
        if self.driver.exists(&sel.logged_in_marker).await? {
            debug!(page_id = %self.page_id, "Existing session is still valid");
            return Ok(LoginOutcome::ExistingSession);
        }

        let email = surface.account_email.as_deref().ok_or_else(|| {
            PublishError::AuthenticationFailed("surface.account_email is not configured".to_string())
        })?;
        let password = surface.resolve_password().ok_or_else(|| {
            PublishError::AuthenticationFailed("no surface account password configured".to_string())
        })?;

        self.type_text(&sel.email_input, email).await?;
        self.type_text(&sel.password_input, &password).await?;
        self.click(&sel.login_button).await?;
        self.dismiss_dialogs().await;

        let mut outcome = LoginOutcome::Password;
        if self.driver.exists(&sel.two_factor_prompt).await? {
            self.state = SessionState::AwaitingTwoFactor;
            self.await_two_factor().await?;
            outcome = LoginOutcome::TwoFactor;
        }

        if let Err(e) = self
            .wait_for(&sel.logged_in_marker, self.options.navigation_timeout)
            .await
        {
            // Still looking at the login form means the credentials were refused
            if self.driver.exists(&sel.email_input).await.unwrap_or(false) {
                return Err(PublishError::AuthenticationFailed(
                    "surface rejected the account credentials".to_string(),
                ));
            }
            return Err(e);
        }

        Ok(outcome)
    }

    /// Block until the challenge is resolved through the broker or the prompt
    /// goes away (approved on another device), bounded by the configured wait.
    async fn await_two_factor(&self) -> Result<(), PublishError> {
        let sel = &self.surface.selectors;
        let limit = self.surface.two_factor_timeout();
        let receiver = self.broker.register(&self.key);

        info!(
            page_id = %self.page_id,
            session = %self.key,
            "Two-factor approval required, waiting up to {}s",
            limit.as_secs()
        );

        let wait = async {
            tokio::select! {
                resolution = receiver => match resolution {
                    Ok(TwoFactorResolution::Approved) => Ok(()),
                    Ok(TwoFactorResolution::Code(code)) => {
                        self.type_text(&sel.two_factor_input, &code).await?;
                        self.click(&sel.two_factor_submit).await
                    }
                    Err(_) => Err(PublishError::AuthenticationFailed(
                        "two-factor challenge was cancelled".to_string(),
                    )),
                },
                () = self.prompt_cleared() => Ok(()),
            }
        };

        let result = tokio::time::timeout(limit, wait).await;
        self.broker.cancel(&self.key);

        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(page_id = %self.page_id, "Two-factor approval timed out");
                Err(PublishError::TwoFactorTimeout(limit))
            }
        }
    }

    async fn prompt_cleared(&self) {
        let prompt = &self.surface.selectors.two_factor_prompt;
        loop {
            tokio::time::sleep(TWO_FACTOR_POLL).await;
            if let Ok(false) = self.driver.exists(prompt).await {
                return;
            }
        }
    }

    async fn open_target(&self, page_id: &str) -> Result<(), PublishError> {
        self.navigate(&self.surface.page_url_for(page_id)).await?;

        let admin = &self.surface.selectors.admin_marker;
        if self
            .wait_for(admin, self.options.element_timeout)
            .await
            .is_err()
        {
            return Err(PublishError::AccessDenied(format!(
                "page {} shows no admin controls",
                page_id
            )));
        }
        Ok(())
    }

    async fn fill_composer(&self, composition: &Composition) -> Result<(), PublishError> {
        let sel = &self.surface.selectors;

        self.click(&sel.composer_open).await.map_err(compose_failed)?;
        self.type_text(&sel.composer_text, &composition.content)
            .await
            .map_err(compose_failed)?;

        if let Some(media) = composition.media.as_deref() {
            let input = sel.media_input.as_str();
            let timeout = self.options.element_timeout;
            self.retry
                .execute("upload", move || async move {
                    self.dismiss_dialogs().await;
                    self.driver.wait_for(input, timeout).await?;
                    self.driver.upload_file(input, media).await
                })
                .await
                .map_err(compose_failed)?;
        }

        self.dismiss_dialogs().await;
        Ok(())
    }

    async fn fill_schedule(&self, publish_at: DateTime<Utc>) -> Result<(), PublishError> {
        let sel = &self.surface.selectors;
        let date = publish_at.format(SCHEDULE_DATE_FORMAT).to_string();
        let time = publish_at.format(SCHEDULE_TIME_FORMAT).to_string();

        self.click(&sel.schedule_toggle).await.map_err(compose_failed)?;
        self.type_text(&sel.schedule_date, &date)
            .await
            .map_err(compose_failed)?;
        self.type_text(&sel.schedule_time, &time)
            .await
            .map_err(compose_failed)?;
        Ok(())
    }

    async fn confirm(&self) -> Result<(), PublishError> {
        let sel = &self.surface.selectors;

        // After an earlier attempt whose click went through, the button is
        // gone and only the confirmation wait is repeated
        if self.driver.exists(&sel.publish_button).await? {
            self.click(&sel.publish_button).await.map_err(confirm_failed)?;
            self.dismiss_dialogs().await;
        }

        self.wait_for(&sel.published_marker, self.options.navigation_timeout)
            .await
            .map_err(|_| {
                PublishError::ConfirmFailed("surface did not confirm the post".to_string())
            })
    }
}

fn reclassify(e: PublishError, into: fn(String) -> PublishError) -> PublishError {
    match e {
        PublishError::TransientSurfaceError(message) => into(message),
        other => other,
    }
}

fn compose_failed(e: PublishError) -> PublishError {
    reclassify(e, PublishError::ComposeFailed)
}

fn confirm_failed(e: PublishError) -> PublishError {
    reclassify(e, PublishError::ConfirmFailed)
}

#[async_trait]
impl PublishSession for BrowserSession {
    fn state(&self) -> SessionState {
        if self.failed {
            SessionState::Failed
        } else {
            self.state
        }
    }

    async fn initialize(&mut self) -> Result<(), PublishError> {
        self.expect(&[SessionState::Uninitialized], "initialize")?;
        let result = self.driver.open(&self.options).await.map_err(|e| match e {
            e @ PublishError::SessionInitFailed(_) => e,
            other => PublishError::SessionInitFailed(other.to_string()),
        });
        self.settle(SessionState::Uninitialized, result, SessionState::Ready)
    }

    async fn login(&mut self) -> Result<LoginOutcome, PublishError> {
        self.expect(&[SessionState::Ready], "log in")?;
        let result = self.run_login().await;
        if let Ok(outcome) = &result {
            info!(page_id = %self.page_id, ?outcome, "Logged in");
        }
        self.settle(SessionState::Ready, result, SessionState::Authenticated)
    }

    async fn navigate_to_target(&mut self, page_id: &str) -> Result<(), PublishError> {
        self.expect(
            &[SessionState::Authenticated, SessionState::OnTarget],
            "navigate to target",
        )?;
        let from = self.state;
        let result = self.open_target(page_id).await;
        self.settle(from, result, SessionState::OnTarget)
    }

    async fn compose(&mut self, composition: &Composition) -> Result<(), PublishError> {
        self.expect(&[SessionState::OnTarget], "compose")?;
        let result = self.fill_composer(composition).await;
        if result.is_ok() {
            self.first_comment = composition.first_comment.clone();
        }
        self.settle(SessionState::OnTarget, result, SessionState::Composed)
    }

    async fn schedule_in_surface(&mut self, publish_at: DateTime<Utc>) -> Result<(), PublishError> {
        self.expect(&[SessionState::Composed], "schedule")?;
        let result = self.fill_schedule(publish_at).await;
        self.settle(SessionState::Composed, result, SessionState::Composed)
    }

    async fn confirm_publish(&mut self) -> Result<(), PublishError> {
        self.expect(&[SessionState::Composed], "confirm")?;
        let result = self.confirm().await;
        self.settle(SessionState::Composed, result, SessionState::Confirmed)
    }

    async fn submit_first_comment(&mut self) -> Result<(), PublishError> {
        self.expect(&[SessionState::Confirmed], "comment")?;
        let Some(comment) = self.first_comment.clone() else {
            return Ok(());
        };

        let sel = &self.surface.selectors;
        self.type_text(&sel.comment_input, &comment).await?;
        self.click(&sel.comment_submit).await
    }

    async fn teardown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.broker.cancel(&self.key);
        if let Err(e) = self.driver.close().await {
            warn!(page_id = %self.page_id, "Failed to close browser: {}", e);
        }
        self.state = SessionState::Closed;
        self.failed = false;
        debug!(page_id = %self.page_id, "Session closed");
    }
}

/// Creates [`BrowserSession`]s carrying the page's access token as a header
pub struct BrowserSessionFactory {
    surface: Arc<SurfaceConfig>,
    broker: Arc<TwoFactorBroker>,
    retry: RetryPolicy,
    drivers: DriverFactory,
}

impl BrowserSessionFactory {
    pub fn new<F>(
        surface: SurfaceConfig,
        broker: Arc<TwoFactorBroker>,
        retry: RetryPolicy,
        drivers: F,
    ) -> Self
    where
        F: Fn() -> Box<dyn SurfaceDriver> + Send + Sync + 'static,
    {
        Self {
            surface: Arc::new(surface),
            broker,
            retry,
            drivers: Arc::new(drivers),
        }
    }
}

impl SessionFactory for BrowserSessionFactory {
    fn create(&self, page: &Page, credential: &Credential) -> Box<dyn PublishSession> {
        let options = DriverOptions::from_surface(&self.surface).with_header(
            self.surface.auth_header.clone(),
            format!("Bearer {}", credential.token()),
        );

        Box::new(BrowserSession::new(
            (self.drivers)(),
            Arc::clone(&self.surface),
            options,
            &page.id,
            Arc::clone(&self.broker),
            self.retry,
        ))
    }
}
