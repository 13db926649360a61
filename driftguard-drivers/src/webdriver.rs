use crate::page::{
    BrowserPage, CookieInfo, ElementHandle, ElementState, PageElement, SemanticQuery,
    StorageKind, Viewport,
};
use crate::semantic::to_xpath;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use driftguard_common::WebDriverSettings;
use fantoccini::{elements::Element, Client, ClientBuilder, Locator};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use webdriver::capabilities::Capabilities;

const DISPLAY_POLL: Duration = Duration::from_millis(100);

/// Wrapper around a `fantoccini` WebDriver session.
pub struct WebDriverSession {
    client: Client,
}

impl WebDriverSession {
    /// Connect to a running WebDriver service (chromedriver by default).
    pub async fn connect(settings: &WebDriverSettings) -> Result<Self> {
        let mut caps = Capabilities::new();
        let mut chrome_opts = HashMap::new();
        let mut args = vec![
            json!("--disable-dev-shm-usage"),
            json!("--no-sandbox"),
            json!("--window-size=1440,900"),
        ];
        if settings.headless {
            args.push(json!("--headless=new"));
            args.push(json!("--disable-gpu"));
        }
        chrome_opts.insert("args".to_string(), json!(args));
        caps.insert("goog:chromeOptions".to_string(), json!(chrome_opts));

        let client = ClientBuilder::native()
            .capabilities(caps)
            .connect(&settings.url)
            .await
            .with_context(|| format!("failed to connect to WebDriver at {}", settings.url))?;

        tracing::info!(url = %settings.url, headless = settings.headless, "driver.session.connected");
        Ok(Self { client })
    }

    /// Navigate to `url` and return the page handle.
    pub async fn goto(&self, url: &str) -> Result<WebDriverPage> {
        self.client
            .goto(url)
            .await
            .with_context(|| format!("navigation to {url} failed"))?;
        Ok(WebDriverPage::new(self.client.clone()))
    }

    /// Close the underlying browser session.
    pub async fn close(self) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }
}

/// [`BrowserPage`] backed by a fantoccini client.
#[derive(Clone)]
pub struct WebDriverPage {
    client: Client,
}

impl WebDriverPage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn wait_for_locator(
        &self,
        locator: Locator<'_>,
        state: ElementState,
        timeout: Duration,
    ) -> Result<ElementHandle> {
        let deadline = Instant::now() + timeout;
        let element = self
            .client
            .wait()
            .at_most(timeout)
            .every(DISPLAY_POLL)
            .for_element(locator)
            .await?;

        if state == ElementState::Visible {
            loop {
                if element.is_displayed().await.unwrap_or(false) {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(anyhow!("element present but not visible"));
                }
                sleep(DISPLAY_POLL).await;
            }
        }

        Ok(Arc::new(WebDriverElement { element }))
    }

    async fn string_list(&self, script: &str) -> Result<Vec<String>> {
        let value = self.client.execute(script, vec![]).await?;
        Ok(value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    async fn wait_for_css(
        &self,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> Result<ElementHandle> {
        self.wait_for_locator(Locator::Css(selector), state, timeout)
            .await
    }

    async fn find_semantic(
        &self,
        query: &SemanticQuery,
        timeout: Duration,
    ) -> Result<ElementHandle> {
        let xpath = to_xpath(query).ok_or_else(|| anyhow!("empty semantic query"))?;
        tracing::debug!(target: "driver.semantic", %xpath, "semantic lookup");
        self.wait_for_locator(Locator::XPath(&xpath), ElementState::Visible, timeout)
            .await
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        Ok(self.client.screenshot().await?)
    }

    async fn content(&self) -> Result<String> {
        Ok(self.client.source().await?)
    }

    async fn url(&self) -> Result<String> {
        Ok(self.client.current_url().await?.to_string())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.client.title().await?)
    }

    async fn viewport(&self) -> Result<Viewport> {
        let value = self
            .client
            .execute("return [window.innerWidth, window.innerHeight];", vec![])
            .await?;
        let dim = |i: usize| value.get(i).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        Ok(Viewport {
            width: dim(0),
            height: dim(1),
        })
    }

    async fn cookies(&self) -> Result<Vec<CookieInfo>> {
        let cookies = self.client.get_all_cookies().await?;
        Ok(cookies
            .iter()
            .map(|c| CookieInfo {
                name: c.name().to_string(),
                domain: c.domain().map(str::to_string),
                path: c.path().map(str::to_string),
                secure: c.secure().unwrap_or(false),
                http_only: c.http_only().unwrap_or(false),
            })
            .collect())
    }

    async fn storage_keys(&self, kind: StorageKind) -> Result<Vec<String>> {
        let script = format!("return Object.keys({});", kind.js_object());
        self.string_list(&script).await
    }
}

/// [`PageElement`] backed by a fantoccini element.
#[derive(Clone)]
pub struct WebDriverElement {
    element: Element,
}

#[async_trait]
impl PageElement for WebDriverElement {
    async fn click(&self) -> Result<()> {
        self.element.click().await?;
        Ok(())
    }

    async fn fill(&self, text: &str) -> Result<()> {
        self.element.clear().await?;
        self.element.send_keys(text).await?;
        Ok(())
    }

    async fn select_option(&self, value: &str) -> Result<()> {
        self.element.select_by_value(value).await?;
        Ok(())
    }

    async fn text(&self) -> Result<String> {
        Ok(self.element.text().await?)
    }
}
