//! Headless Chrome behind the `Page` trait, plus the providers that hand out sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use headless_chrome::protocol::cdp::Page as Cdp;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, Tab};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::dom;
use crate::page::{ElementSnapshot, Page, PageProvider};

const TEXT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const ADSPOWER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ADSPOWER_POLL_ATTEMPTS: usize = 15;
const LOCAL_API_TIMEOUT: Duration = Duration::from_secs(30);

/// A CDP connection and the tab we drive. All tab calls block, so they run
/// on the blocking pool.
pub struct ChromePage {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromePage {
    /// Connect to a DevTools websocket and take over its first tab.
    pub async fn connect(ws_url: String) -> Result<Self> {
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let browser = Browser::connect(ws_url.clone())
                .with_context(|| format!("connect to {ws_url}"))?;
            let tab = {
                let tabs = browser.get_tabs();
                let tabs = tabs
                    .lock()
                    .map_err(|_| anyhow!("browser tab list poisoned"))?;
                tabs.first().cloned()
            };
            let tab = match tab {
                Some(tab) => tab,
                None => {
                    debug!("no open tab, creating one");
                    browser.new_tab()?
                }
            };
            Ok(Self {
                _browser: browser,
                tab,
            })
        })
        .await
        .context("browser connect task panicked")?
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || op(&tab))
            .await
            .context("browser task panicked")?
    }
}

/// Re-evaluate `js` until it yields `true` or `timeout` passes.
fn poll_until(tab: &Tab, js: &str, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if dom::evaluate_bool(tab, js)? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(TEXT_POLL_INTERVAL);
    }
}

/// Clip covering the whole scrollable document, never empty.
fn full_page_clip(width: f64, height: f64) -> Cdp::Viewport {
    Cdp::Viewport {
        x: 0.0,
        y: 0.0,
        width: width.max(1.0),
        height: height.max(1.0),
        scale: 1.0,
    }
}

fn full_page_png(tab: &Tab) -> Result<Vec<u8>> {
    let metrics = tab
        .call_method(Cdp::GetLayoutMetrics(None))
        .context("read layout metrics")?;
    let size = metrics.css_content_size;
    let shot = tab
        .call_method(Cdp::CaptureScreenshot {
            format: Some(CaptureScreenshotFormatOption::Png),
            quality: None,
            clip: Some(full_page_clip(size.width, size.height)),
            from_surface: Some(true),
            capture_beyond_viewport: Some(true),
            optimize_for_speed: None,
        })
        .context("capture screenshot")?;
    STANDARD.decode(shot.data).context("decode screenshot")
}

#[async_trait]
impl Page for ChromePage {
    async fn goto(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .with_context(|| format!("navigate to {url}"))?;
            tab.wait_until_navigated()
                .context("navigation did not complete")?;
            Ok(())
        })
        .await
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)
                .with_context(|| format!("{selector} did not appear within {timeout:?}"))?;
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            tab.find_element(&selector)
                .with_context(|| format!("find {selector}"))?
                .click()
                .with_context(|| format!("click {selector}"))?;
            Ok(())
        })
        .await
    }

    async fn click_with_text(&self, selector: &str, text: &str, timeout: Duration) -> Result<()> {
        let js = dom::click_with_text_js(selector, text);
        let what = format!("{selector} with text {text:?}");
        self.blocking(move |tab| {
            if poll_until(tab, &js, timeout)? {
                Ok(())
            } else {
                bail!("no {what} within {timeout:?}")
            }
        })
        .await
    }

    async fn wait_for_text(&self, selector: &str, text: &str, timeout: Duration) -> Result<()> {
        let js = dom::contains_text_js(selector, text);
        let what = format!("{selector} containing {text:?}");
        self.blocking(move |tab| {
            if poll_until(tab, &js, timeout)? {
                Ok(())
            } else {
                bail!("no {what} within {timeout:?}")
            }
        })
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.blocking(move |tab| {
            tab.find_element(&selector)
                .with_context(|| format!("find {selector}"))?
                .click()
                .with_context(|| format!("focus {selector}"))?;
            tab.type_str(&text).context("type text")?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |tab| {
            tab.press_key(&key).with_context(|| format!("press {key}"))?;
            Ok(())
        })
        .await
    }

    async fn snapshot_all(&self, selector: &str, limit: usize) -> Result<Vec<ElementSnapshot>> {
        let js = dom::snapshot_js(selector, limit);
        self.blocking(move |tab| dom::parse_snapshots(&dom::evaluate_string(tab, &js)?))
            .await
    }

    async fn url(&self) -> Result<String> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn html(&self) -> Result<String> {
        self.blocking(|tab| dom::evaluate_string(tab, dom::OUTER_HTML_JS))
            .await
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        self.blocking(full_page_png).await
    }
}

#[derive(Debug, Deserialize)]
struct LocalApiReply<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct BrowserStatus {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    ws: Option<WsEndpoints>,
}

#[derive(Debug, Default, Deserialize)]
struct WsEndpoints {
    #[serde(default)]
    puppeteer: Option<String>,
}

impl BrowserStatus {
    fn active_endpoint(&self) -> Option<&str> {
        if self.status.as_deref() != Some("Active") {
            return None;
        }
        self.ws
            .as_ref()
            .and_then(|ws| ws.puppeteer.as_deref())
            .filter(|url| !url.is_empty())
    }
}

/// Anti-detect browser profiles started through the AdsPower local API.
pub struct AdsPowerProvider {
    client: Client,
    base: Url,
}

impl AdsPowerProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(LOCAL_API_TIMEOUT)
            .build()
            .context("build AdsPower http client")?;
        let base = Url::parse(base_url).with_context(|| format!("invalid AdsPower url {base_url}"))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str, profile_id: &str, extra: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base.join(path)?;
        url.query_pairs_mut()
            .append_pair("user_id", profile_id)
            .extend_pairs(extra);
        Ok(url)
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<Option<T>> {
        let reply: LocalApiReply<T> = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("AdsPower request {}", url.path()))?
            .json()
            .await
            .context("decode AdsPower reply")?;
        if reply.code != 0 {
            bail!("AdsPower {} failed: {}", url.path(), reply.msg);
        }
        Ok(reply.data)
    }

    async fn wait_until_active(&self, profile_id: &str) -> Result<String> {
        let url = self.endpoint("/api/v1/browser/active", profile_id, &[])?;
        for attempt in 1..=ADSPOWER_POLL_ATTEMPTS {
            let status: BrowserStatus = self.call(url.clone()).await?.unwrap_or_default();
            if let Some(ws) = status.active_endpoint() {
                return Ok(ws.to_string());
            }
            debug!(profile_id, attempt, "profile not active yet");
            tokio::time::sleep(ADSPOWER_POLL_INTERVAL).await;
        }
        bail!("profile {profile_id} did not become active after {ADSPOWER_POLL_ATTEMPTS} checks")
    }

    async fn attach(&self, profile_id: &str) -> Result<ChromePage> {
        let ws = self.wait_until_active(profile_id).await?;
        ChromePage::connect(ws).await
    }

    async fn stop(&self, profile_id: &str) -> Result<()> {
        let stop = self.endpoint("/api/v1/browser/stop", profile_id, &[])?;
        self.call::<serde_json::Value>(stop).await?;
        info!(profile_id, "AdsPower profile stopped");
        Ok(())
    }
}

#[async_trait]
impl PageProvider for AdsPowerProvider {
    async fn open(&self, profile_id: &str) -> Result<Box<dyn Page>> {
        info!(profile_id, "starting AdsPower profile");
        let start = self.endpoint("/api/v1/browser/start", profile_id, &[("open_tabs", "0")])?;
        self.call::<BrowserStatus>(start).await?;
        match self.attach(profile_id).await {
            Ok(page) => {
                info!(profile_id, "AdsPower profile connected");
                Ok(Box::new(page))
            }
            Err(e) => {
                // The profile is running at this point; stop it before giving up.
                if let Err(stop_err) = self.stop(profile_id).await {
                    warn!(profile_id, error = %format!("{stop_err:#}"), "could not stop half-started profile");
                }
                Err(e)
            }
        }
    }

    async fn release(&self, profile_id: &str, page: Box<dyn Page>) -> Result<()> {
        drop(page);
        self.stop(profile_id).await
    }
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// A Chrome started by hand with `--remote-debugging-port`. The profile id
/// is ignored and the browser stays open after release.
pub struct AttachProvider {
    client: Client,
    debug_url: Url,
}

impl AttachProvider {
    pub fn new(debug_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(LOCAL_API_TIMEOUT)
            .build()
            .context("build debug-port http client")?;
        let debug_url =
            Url::parse(debug_url).with_context(|| format!("invalid debug url {debug_url}"))?;
        Ok(Self { client, debug_url })
    }
}

#[async_trait]
impl PageProvider for AttachProvider {
    async fn open(&self, profile_id: &str) -> Result<Box<dyn Page>> {
        let url = self.debug_url.join("/json/version")?;
        let info: VersionInfo = self
            .client
            .get(url)
            .send()
            .await
            .context("query Chrome debug port")?
            .json()
            .await
            .context("decode /json/version")?;
        info!(profile_id, "attaching to running Chrome");
        Ok(Box::new(ChromePage::connect(info.web_socket_debugger_url).await?))
    }

    async fn release(&self, profile_id: &str, page: Box<dyn Page>) -> Result<()> {
        drop(page);
        debug!(profile_id, "detached from Chrome");
        Ok(())
    }
}
