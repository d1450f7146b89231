//! WebDriver session client for the Appium endpoint on a worker pod.
//!
//! Drives the fixed browser script the farm runs against every job:
//! dismiss Chrome's first-run dialogs if they are present, wait for the
//! webview context to appear, navigate to the target URL, and read the
//! resulting page title. Session teardown is a separate idempotent
//! operation so the release path can always invoke it, whatever the
//! script itself did.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

/// Chrome first-run dialog elements, dismissed best-effort.
const TERMS_ACCEPT_ID: &str = "com.android.chrome:id/terms_accept";
const NO_THANKS_ID: &str = "com.android.chrome:id/negative_button";

/// Errors from the automation driver.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transport-level failure talking to the endpoint.
    #[error("driver request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a WebDriver error or a payload the
    /// client could not interpret.
    #[error("driver protocol error: {0}")]
    Protocol(String),

    /// No webview context appeared within the attempt budget.
    #[error("no webview context after {attempts} attempts")]
    WebviewTimeout { attempts: u32 },
}

/// Opens UI sessions against a reachable endpoint.
#[async_trait]
pub trait UiDriver: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn UiSession>, DriverError>;
}

/// One live UI session.
#[async_trait]
pub trait UiSession: Send {
    /// Run the fixed script against `target_url` and return the page
    /// title.
    async fn exercise(&mut self, target_url: &str) -> Result<String, DriverError>;

    /// End the session. Safe to call repeatedly, including after
    /// `exercise` failed partway.
    async fn quit(&mut self) -> Result<(), DriverError>;
}

/// Appium/UiAutomator2 Chrome driver speaking the W3C WebDriver protocol.
pub struct AppiumChromeDriver {
    client: reqwest::Client,
    /// Attempts while waiting for a webview context to appear.
    webview_attempts: u32,
    /// Sleep between webview context polls.
    webview_interval: Duration,
}

impl AppiumChromeDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            webview_attempts: 30,
            webview_interval: Duration::from_secs(1),
        }
    }

    /// Session capabilities for a Chrome browser session on the emulator.
    fn capabilities() -> Value {
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "platformName": "Android",
                    "browserName": "Chrome",
                    "appium:automationName": "UiAutomator2",
                    "appium:newCommandTimeout": 300,
                    "appium:chromeOptions": { "w3c": true },
                    "appium:allowInsecure": "chromedriver_autodownload"
                }
            }
        })
    }
}

impl Default for AppiumChromeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UiDriver for AppiumChromeDriver {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn UiSession>, DriverError> {
        let resp: Value = self
            .client
            .post(format!("{endpoint}/session"))
            .json(&Self::capabilities())
            .send()
            .await?
            .json()
            .await?;

        let session_id = resp["value"]["sessionId"]
            .as_str()
            .ok_or_else(|| DriverError::Protocol(format!("no sessionId in {resp}")))?
            .to_string();
        info!(session_id = %session_id, "driver session created");

        Ok(Box::new(AppiumSession {
            client: self.client.clone(),
            base: format!("{endpoint}/session/{session_id}"),
            session_id: Some(session_id),
            webview_attempts: self.webview_attempts,
            webview_interval: self.webview_interval,
        }))
    }
}

/// Live Appium session bound to one worker.
struct AppiumSession {
    client: reqwest::Client,
    base: String,
    session_id: Option<String>,
    webview_attempts: u32,
    webview_interval: Duration,
}

impl AppiumSession {
    async fn post(&self, path: &str, body: Value) -> Result<Value, DriverError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    async fn get(&self, path: &str) -> Result<Value, DriverError> {
        let resp = self.client.get(format!("{}{path}", self.base)).send().await?;
        Ok(resp.json().await?)
    }

    async fn switch_context(&self, name: &str) -> Result<(), DriverError> {
        self.post("/context", json!({ "name": name })).await?;
        Ok(())
    }

    /// Find an element by resource id. `Ok(None)` when the element is not
    /// on screen; absence is normal for the first-run dialogs.
    async fn find_by_id(&self, id: &str) -> Result<Option<String>, DriverError> {
        let resp = self
            .post("/element", json!({ "using": "id", "value": id }))
            .await?;

        if resp["value"]["error"].is_string() {
            return Ok(None);
        }
        Ok(resp["value"]
            .as_object()
            .and_then(|obj| obj.values().next())
            .and_then(Value::as_str)
            .map(ToString::to_string))
    }

    async fn click(&self, element_id: &str) -> Result<(), DriverError> {
        self.post(&format!("/element/{element_id}/click"), json!({}))
            .await?;
        Ok(())
    }

    /// Dismiss Chrome's terms and sync dialogs when they are present.
    async fn dismiss_first_run(&self) -> Result<(), DriverError> {
        self.switch_context("NATIVE_APP").await?;

        if let Some(accept) = self.find_by_id(TERMS_ACCEPT_ID).await? {
            self.click(&accept).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(decline) = self.find_by_id(NO_THANKS_ID).await? {
                self.click(&decline).await?;
            }
        }
        Ok(())
    }

    /// Poll the context list until a webview shows up, then switch to it.
    async fn enter_webview(&self) -> Result<(), DriverError> {
        for attempt in 1..=self.webview_attempts {
            let resp = self.get("/contexts").await?;
            let webview = resp["value"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .find(|ctx| ctx.contains("CHROMIUM") || ctx.contains("WEBVIEW"));

            if let Some(ctx) = webview {
                debug!(context = %ctx, attempt, "webview context available");
                let name = ctx.to_string();
                self.switch_context(&name).await?;
                return Ok(());
            }
            tokio::time::sleep(self.webview_interval).await;
        }
        Err(DriverError::WebviewTimeout {
            attempts: self.webview_attempts,
        })
    }
}

#[async_trait]
impl UiSession for AppiumSession {
    async fn exercise(&mut self, target_url: &str) -> Result<String, DriverError> {
        self.dismiss_first_run().await?;
        self.enter_webview().await?;

        self.post("/url", json!({ "url": target_url })).await?;

        let resp = self.get("/title").await?;
        let title = resp["value"]
            .as_str()
            .ok_or_else(|| DriverError::Protocol(format!("no title in {resp}")))?
            .to_string();
        info!(title = %title, url = %target_url, "page loaded");
        Ok(title)
    }

    async fn quit(&mut self) -> Result<(), DriverError> {
        if self.session_id.take().is_some() {
            self.client.delete(&self.base).send().await?;
            debug!("driver session closed");
        }
        Ok(())
    }
}
