//! Browser-driven fetch strategy for portals that fingerprint plain clients.
//!
//! One [`BrowserSession`] owns one Chromium process for a whole vendor run.
//! The process is launched lazily on first use, warmed up against the portal
//! homepage so cookies are in place, and shared by a small pool of tabs.
//! Every tab gets the stealth init script and the configured user agent
//! before its first navigation.
//!
//! Release is guaranteed: [`BrowserSession::shutdown`] is the normal path and
//! `Drop` spawns the same cleanup if a run unwinds without reaching it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use advstage_core::FetchStrategy;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::DEFAULT_USER_AGENT;
use crate::retry::jitter_between;
use crate::{FetchError, PageFetcher};

/// Masks the properties bot-detection scripts check first.
pub const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
"#;

#[derive(Debug, Clone)]
pub struct BrowserSessionConfig {
    pub user_agent: String,
    pub window: (u32, u32),
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub warmup_url: Option<String>,
    pub warmup_settle: Duration,
    pub navigation_timeout: Duration,
    pub ready_selector: String,
    pub think_time: (Duration, Duration),
    pub tabs: usize,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window: (1366, 768),
            headless: true,
            chrome_executable: None,
            warmup_url: None,
            warmup_settle: Duration::from_secs(8),
            navigation_timeout: Duration::from_secs(60),
            ready_selector: "body".to_string(),
            think_time: (Duration::from_millis(1500), Duration::from_millis(2500)),
            tabs: 1,
        }
    }
}

struct Launched {
    browser: Mutex<Browser>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

pub struct BrowserSession {
    config: BrowserSessionConfig,
    launched: OnceCell<Launched>,
    idle_tabs: Mutex<Vec<Page>>,
    tab_slots: Semaphore,
    closed: AtomicBool,
}

impl BrowserSession {
    pub fn new(config: BrowserSessionConfig) -> Self {
        let tabs = config.tabs.max(1);
        Self {
            config,
            launched: OnceCell::new(),
            idle_tabs: Mutex::new(Vec::new()),
            tab_slots: Semaphore::new(tabs),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BrowserSessionConfig {
        &self.config
    }

    async fn launched(&self) -> Result<&Launched, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::Session("browser session already closed".to_string()));
        }
        self.launched.get_or_try_init(|| self.launch()).await
    }

    async fn launch(&self) -> Result<Launched, FetchError> {
        let (width, height) = self.config.window;
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(width, height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage");
        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder.build().map_err(FetchError::Session)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|err| FetchError::Session(format!("launching chromium: {err}")))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler stopped");
                    break;
                }
            }
        });

        let launched = Launched {
            browser: Mutex::new(browser),
            handler: Mutex::new(Some(handler)),
        };

        if let Some(url) = &self.config.warmup_url {
            info!(url = url.as_str(), "warming up browser session");
            let page = match self.open_tab(&launched).await {
                Ok(page) => page,
                Err(err) => {
                    close_launched(launched).await;
                    return Err(FetchError::Session(format!("opening warm-up tab: {err}")));
                }
            };
            let warmed = tokio::time::timeout(self.config.navigation_timeout, page.goto(url.as_str())).await;
            match warmed {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    close_launched(launched).await;
                    return Err(FetchError::Session(format!("warm-up navigation to {url}: {err}")));
                }
                Err(_) => {
                    close_launched(launched).await;
                    return Err(FetchError::Session(format!("warm-up navigation to {url} timed out")));
                }
            }
            tokio::time::sleep(self.config.warmup_settle).await;
            self.idle_tabs.lock().await.push(page);
        }

        Ok(launched)
    }

    async fn open_tab(&self, launched: &Launched) -> Result<Page, CdpError> {
        let page = {
            let browser = launched.browser.lock().await;
            browser.new_page("about:blank").await?
        };
        page.execute(SetUserAgentOverrideParams::new(self.config.user_agent.clone()))
            .await?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await?;
        Ok(page)
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<String, CdpError> {
        page.goto(url).await?;
        page.find_element(self.config.ready_selector.as_str()).await?;
        let (low, high) = self.config.think_time;
        tokio::time::sleep(jitter_between(low, high)).await;
        page.content().await
    }

    /// Close every tab and the browser process. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tabs: Vec<Page> = self.idle_tabs.lock().await.drain(..).collect();
        for tab in tabs {
            let _ = tab.close().await;
        }
        if let Some(launched) = self.launched.get() {
            let mut browser = launched.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "closing browser failed");
            }
            let _ = browser.wait().await;
            if let Some(handler) = launched.handler.lock().await.take() {
                handler.abort();
            }
            info!("browser session closed");
        }
    }
}

async fn close_launched(launched: Launched) {
    let mut browser = launched.browser.into_inner();
    let _ = browser.close().await;
    let _ = browser.wait().await;
    if let Some(handler) = launched.handler.into_inner() {
        handler.abort();
    }
}

#[async_trait]
impl PageFetcher for BrowserSession {
    fn strategy(&self) -> FetchStrategy {
        FetchStrategy::Browser
    }

    async fn warm_up(&self) -> Result<(), FetchError> {
        self.launched().await.map(|_| ())
    }

    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let launched = self.launched().await?;
        let _slot = self
            .tab_slots
            .acquire()
            .await
            .map_err(|_| FetchError::Session("browser session closed".to_string()))?;

        let idle = self.idle_tabs.lock().await.pop();
        let page = match idle {
            Some(page) => page,
            None => self
                .open_tab(launched)
                .await
                .map_err(|err| FetchError::Navigation {
                    url: url.to_string(),
                    message: format!("opening tab: {err}"),
                })?,
        };

        let timeout = self.config.navigation_timeout;
        match tokio::time::timeout(timeout, self.navigate(&page, url)).await {
            Ok(Ok(html)) => {
                self.idle_tabs.lock().await.push(page);
                Ok(html)
            }
            Ok(Err(err)) => {
                let _ = page.close().await;
                Err(FetchError::Navigation {
                    url: url.to_string(),
                    message: err.to_string(),
                })
            }
            Err(_) => {
                let _ = page.close().await;
                Err(FetchError::Timeout {
                    url: url.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn shutdown(&self) {
        BrowserSession::shutdown(self).await;
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(launched) = self.launched.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    close_launched(launched).await;
                    debug!("browser session closed from drop");
                });
            }
            Err(_) => warn!("browser session dropped outside a runtime; chromium may linger"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stealth_script_masks_webdriver_and_chrome_runtime() {
        assert!(STEALTH_SCRIPT.contains("'webdriver'"));
        assert!(STEALTH_SCRIPT.contains("runtime"));
    }

    #[tokio::test]
    async fn closed_session_refuses_to_launch() {
        let session = BrowserSession::new(BrowserSessionConfig::default());
        session.shutdown().await;
        let err = session.warm_up().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn tab_pool_has_at_least_one_slot() {
        let session = BrowserSession::new(BrowserSessionConfig {
            tabs: 0,
            ..Default::default()
        });
        assert_eq!(session.tab_slots.available_permits(), 1);
    }
}
