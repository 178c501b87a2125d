//! Headless Chrome driver
//!
//! `headless_chrome` is synchronous, so every call runs on the blocking pool
//! with its own handle to the tab. JavaScript dialogs are accepted as soon as
//! the tab reports them, whatever the session is doing at the time.

use async_trait::async_trait;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Page as CdpPage;
use headless_chrome::protocol::cdp::{Network, DOM};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PublishError;
use crate::surface::{DriverOptions, SurfaceDriver};

#[derive(Default)]
pub struct ChromeDriver {
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
}

impl ChromeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn tab(&self) -> Result<Arc<Tab>, PublishError> {
        self.tab
            .clone()
            .ok_or_else(|| PublishError::SessionInitFailed("browser is not open".to_string()))
    }

    /// Run `f` against the tab on the blocking pool
    async fn on_tab<T, F>(&self, what: &str, f: F) -> Result<T, PublishError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = self.tab()?;
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| PublishError::TransientSurfaceError(format!("{}: {}", what, e)))?
            .map_err(|e| PublishError::TransientSurfaceError(format!("{}: {}", what, e)))
    }
}

fn launch(options: DriverOptions) -> anyhow::Result<(Browser, Arc<Tab>)> {
    let launch_options = LaunchOptions::default_builder()
        .headless(options.headless)
        .build()
        .map_err(|e| anyhow::anyhow!("invalid launch options: {}", e))?;

    let browser = Browser::new(launch_options)?;
    let tab = browser.new_tab()?;

    tab.set_default_timeout(options.navigation_timeout);
    tab.set_user_agent(&options.user_agent, None, None)?;

    if !options.extra_headers.is_empty() {
        let headers: HashMap<&str, &str> = options
            .extra_headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        tab.set_extra_http_headers(headers)?;
    }

    accept_dialogs_on_open(&tab)?;

    if !options.blocked_resources.is_empty() {
        let blocked = tab.call_method(Network::SetBlockedURLs {
            urls: options.blocked_resources.clone(),
        });
        if let Err(e) = blocked {
            // Blocking only saves bandwidth, the session still works without it
            warn!("Failed to block control-channel resources: {}", e);
        }
    }

    Ok((browser, tab))
}

fn accept_dialog(tab: &Tab) -> anyhow::Result<()> {
    tab.call_method(CdpPage::HandleJavaScriptDialog {
        accept: true,
        prompt_text: None,
    })?;
    Ok(())
}

/// Accept every dialog the moment it opens. The listener holds a weak
/// handle so it does not keep the tab alive.
fn accept_dialogs_on_open(tab: &Arc<Tab>) -> anyhow::Result<()> {
    let weak = Arc::downgrade(tab);
    tab.add_event_listener(Arc::new(move |event: &Event| {
        if let Event::PageJavascriptDialogOpening(opening) = event {
            let Some(tab) = weak.upgrade() else {
                return;
            };
            debug!(message = %opening.params.message, "Accepting dialog");
            if let Err(e) = accept_dialog(&tab) {
                warn!("Failed to accept dialog: {}", e);
            }
        }
    }))?;
    Ok(())
}

#[async_trait]
impl SurfaceDriver for ChromeDriver {
    async fn open(&mut self, options: &DriverOptions) -> Result<(), PublishError> {
        let options = options.clone();
        let (browser, tab) = tokio::task::spawn_blocking(move || launch(options))
            .await
            .map_err(|e| PublishError::SessionInitFailed(e.to_string()))?
            .map_err(|e| PublishError::SessionInitFailed(format!("failed to launch browser: {}", e)))?;

        debug!("Browser launched");
        self.browser = Some(browser);
        self.tab = Some(tab);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), PublishError> {
        let url = url.to_string();
        self.on_tab("navigate", move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), PublishError> {
        let selector = selector.to_string();
        self.on_tab("wait for element", move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, selector: &str) -> Result<bool, PublishError> {
        let selector = selector.to_string();
        self.on_tab("find element", move |tab| Ok(tab.find_element(&selector).is_ok()))
            .await
    }

    async fn click(&self, selector: &str) -> Result<(), PublishError> {
        let selector = selector.to_string();
        self.on_tab("click", move |tab| {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PublishError> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.on_tab("type", move |tab| {
            tab.find_element(&selector)?.type_into(&text)?;
            Ok(())
        })
        .await
    }

    async fn upload_file(&self, selector: &str, path: &Path) -> Result<(), PublishError> {
        let selector = selector.to_string();
        let file = path.to_string_lossy().into_owned();
        self.on_tab("upload", move |tab| {
            let input = tab.find_element(&selector)?;
            tab.call_method(DOM::SetFileInputFiles {
                files: vec![file],
                node_id: None,
                backend_node_id: None,
                object_id: Some(input.remote_object_id.clone()),
            })?;
            Ok(())
        })
        .await
    }

    async fn accept_dialogs(&self) -> Result<(), PublishError> {
        self.on_tab("accept dialog", |tab| {
            // Errors when no dialog is showing
            let _ = accept_dialog(tab);
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> Result<(), PublishError> {
        let tab = self.tab.take();
        let browser = self.browser.take();
        if tab.is_none() && browser.is_none() {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || {
            if let Some(tab) = tab {
                if let Err(e) = tab.close(true) {
                    warn!("Failed to close tab: {}", e);
                }
            }
            // Dropping the browser terminates the process
            drop(browser);
        })
        .await
        .map_err(|e| PublishError::TransientSurfaceError(format!("close: {}", e)))?;

        debug!("Browser closed");
        Ok(())
    }
}
