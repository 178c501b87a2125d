//! Scriptable in-memory surface for tests
//!
//! The mock keeps a set of selectors that are "on screen". Clicking can
//! reveal or hide selectors, and selectors can be made flaky for a number of
//! interactions. A JavaScript dialog, once open, blocks every interaction
//! until it is accepted. Clones share state, so a test can keep a handle and
//! inspect the recorded calls after the session has consumed its copy.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::PublishError;
use crate::surface::{DriverOptions, SurfaceDriver};

/// One recorded driver interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Open,
    Navigate(String),
    WaitFor(String),
    Click(String),
    TypeText(String, String),
    Upload(String, PathBuf),
    AcceptDialogs,
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    present: HashSet<String>,
    reveal_on_click: HashMap<String, Vec<String>>,
    hide_on_click: HashMap<String, Vec<String>>,
    flaky: HashMap<String, u32>,
    dialog_on_click: HashMap<String, String>,
    /// Message of the dialog currently showing
    dialog: Option<String>,
    open_error: Option<String>,
    options: Option<DriverOptions>,
    calls: Vec<DriverCall>,
    uploaded_files_existed: Vec<bool>,
    open: bool,
    close_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark selectors as present from the start
    pub fn with_present<S: AsRef<str>>(self, selectors: &[S]) -> Self {
        self.show(selectors);
        self
    }

    /// Clicking `selector` makes `revealed` appear
    pub fn reveal_on_click<S: AsRef<str>>(self, selector: &str, revealed: &[S]) -> Self {
        self.state
            .lock()
            .unwrap()
            .reveal_on_click
            .entry(selector.to_string())
            .or_default()
            .extend(revealed.iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Clicking `selector` removes `hidden`
    pub fn hide_on_click<S: AsRef<str>>(self, selector: &str, hidden: &[S]) -> Self {
        self.state
            .lock()
            .unwrap()
            .hide_on_click
            .entry(selector.to_string())
            .or_default()
            .extend(hidden.iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// The next `failures` interactions with `selector` fail transiently
    pub fn with_flaky(self, selector: &str, failures: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .flaky
            .insert(selector.to_string(), failures);
        self
    }

    /// Clicking `selector` opens a dialog saying `message`
    pub fn dialog_on_click(self, selector: &str, message: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .dialog_on_click
            .insert(selector.to_string(), message.to_string());
        self
    }

    /// Show a dialog right now, as if the page raised one on its own
    pub fn open_dialog(&self, message: &str) {
        self.state.lock().unwrap().dialog = Some(message.to_string());
    }

    pub fn dialog_open(&self) -> bool {
        self.state.lock().unwrap().dialog.is_some()
    }

    pub fn with_open_error(self, error: &str) -> Self {
        self.state.lock().unwrap().open_error = Some(error.to_string());
        self
    }

    pub fn show<S: AsRef<str>>(&self, selectors: &[S]) {
        let mut state = self.state.lock().unwrap();
        state
            .present
            .extend(selectors.iter().map(|s| s.as_ref().to_string()));
    }

    pub fn hide<S: AsRef<str>>(&self, selectors: &[S]) {
        let mut state = self.state.lock().unwrap();
        for selector in selectors {
            state.present.remove(selector.as_ref());
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clicked(&self, selector: &str) -> bool {
        self.calls()
            .iter()
            .any(|c| matches!(c, DriverCall::Click(s) if s == selector))
    }

    /// Text typed into `selector`, in order
    pub fn typed_into(&self, selector: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::TypeText(s, text) if s == selector => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Upload(_, path) => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Whether each uploaded file existed on disk at upload time
    pub fn uploaded_files_existed(&self) -> Vec<bool> {
        self.state.lock().unwrap().uploaded_files_existed.clone()
    }

    pub fn options(&self) -> Option<DriverOptions> {
        self.state.lock().unwrap().options.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_count
    }

    fn record(&self, call: DriverCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    /// Consume one injected failure for `selector`, if any are left
    fn take_failure(&self, selector: &str) -> Result<(), PublishError> {
        let mut state = self.state.lock().unwrap();
        match state.flaky.get_mut(selector) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(PublishError::TransientSurfaceError(format!(
                    "flaky element {}",
                    selector
                )))
            }
            _ => Ok(()),
        }
    }

    fn check_dialog(&self) -> Result<(), PublishError> {
        match &self.state.lock().unwrap().dialog {
            Some(message) => Err(PublishError::TransientSurfaceError(format!(
                "blocked by dialog: {}",
                message
            ))),
            None => Ok(()),
        }
    }

    fn require_present(&self, selector: &str) -> Result<(), PublishError> {
        self.check_dialog()?;
        self.take_failure(selector)?;
        if self.state.lock().unwrap().present.contains(selector) {
            Ok(())
        } else {
            Err(PublishError::TransientSurfaceError(format!(
                "element not found: {}",
                selector
            )))
        }
    }
}

#[async_trait]
impl SurfaceDriver for MockDriver {
    async fn open(&mut self, options: &DriverOptions) -> Result<(), PublishError> {
        self.record(DriverCall::Open);
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.open_error.clone() {
            return Err(PublishError::SessionInitFailed(error));
        }
        state.options = Some(options.clone());
        state.open = true;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), PublishError> {
        self.record(DriverCall::Navigate(url.to_string()));
        self.check_dialog()?;
        self.take_failure(url)
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<(), PublishError> {
        self.record(DriverCall::WaitFor(selector.to_string()));
        self.require_present(selector)
    }

    async fn exists(&self, selector: &str) -> Result<bool, PublishError> {
        Ok(self.state.lock().unwrap().present.contains(selector))
    }

    async fn click(&self, selector: &str) -> Result<(), PublishError> {
        self.record(DriverCall::Click(selector.to_string()));
        self.require_present(selector)?;

        let mut state = self.state.lock().unwrap();
        let revealed = state.reveal_on_click.get(selector).cloned().unwrap_or_default();
        let hidden = state.hide_on_click.get(selector).cloned().unwrap_or_default();
        state.present.extend(revealed);
        for selector in hidden {
            state.present.remove(&selector);
        }
        if let Some(message) = state.dialog_on_click.get(selector).cloned() {
            state.dialog = Some(message);
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PublishError> {
        self.record(DriverCall::TypeText(selector.to_string(), text.to_string()));
        self.require_present(selector)
    }

    async fn upload_file(&self, selector: &str, path: &Path) -> Result<(), PublishError> {
        self.record(DriverCall::Upload(selector.to_string(), path.to_path_buf()));
        self.require_present(selector)?;
        self.state
            .lock()
            .unwrap()
            .uploaded_files_existed
            .push(path.exists());
        Ok(())
    }

    async fn accept_dialogs(&self) -> Result<(), PublishError> {
        self.record(DriverCall::AcceptDialogs);
        self.state.lock().unwrap().dialog = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PublishError> {
        self.record(DriverCall::Close);
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.close_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_click_reveals_and_hides() {
        let driver = MockDriver::new()
            .with_present(&["#login", "#form"])
            .reveal_on_click("#login", &["#home"])
            .hide_on_click("#login", &["#form"]);

        driver.click("#login").await.unwrap();

        assert!(driver.exists("#home").await.unwrap());
        assert!(!driver.exists("#form").await.unwrap());
        assert!(driver.clicked("#login"));
    }

    #[tokio::test]
    async fn test_missing_element_is_transient() {
        let driver = MockDriver::new();
        let err = driver
            .wait_for("#nope", Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_flaky_selector_recovers() {
        let driver = MockDriver::new().with_present(&["#btn"]).with_flaky("#btn", 2);

        assert!(driver.click("#btn").await.is_err());
        assert!(driver.click("#btn").await.is_err());
        assert!(driver.click("#btn").await.is_ok());
    }

    #[tokio::test]
    async fn test_dialog_blocks_until_accepted() {
        let driver = MockDriver::new()
            .with_present(&["#save", "#next"])
            .dialog_on_click("#save", "Leave site?");

        driver.click("#save").await.unwrap();
        assert!(driver.dialog_open());
        assert!(driver.click("#next").await.unwrap_err().is_retryable());
        assert!(driver.navigate("https://surface.test").await.is_err());

        driver.accept_dialogs().await.unwrap();
        assert!(!driver.dialog_open());
        assert!(driver.click("#next").await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let handle = MockDriver::new();
        let mut driver = handle.clone();

        driver
            .open(&DriverOptions::from_surface(&Default::default()))
            .await
            .unwrap();
        assert!(handle.is_open());

        driver.close().await.unwrap();
        assert!(!handle.is_open());
        assert_eq!(handle.close_count(), 1);
    }
}
