//! Browser capability consumed by the resilience engine.
//!
//! The engine never talks to a browser directly; it is handed a
//! [`BrowserPage`] and receives [`ElementHandle`]s back.
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Condition an element must meet before a wait succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    /// Present in the DOM.
    Attached,
    /// Present and displayed.
    Visible,
}

/// Role/label/text/placeholder description of an element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SemanticQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

impl SemanticQuery {
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.label.is_none()
            && self.text.is_none()
            && self.placeholder.is_none()
    }

    /// Compact human-readable form, e.g. `role=textbox label="Email"`.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(role) = &self.role {
            parts.push(format!("role={role}"));
        }
        if let Some(label) = &self.label {
            parts.push(format!("label={label:?}"));
        }
        if let Some(text) = &self.text {
            parts.push(format!("text={text:?}"));
        }
        if let Some(placeholder) = &self.placeholder {
            parts.push(format!("placeholder={placeholder:?}"));
        }
        parts.join(" ")
    }
}

/// Cookie metadata. Values are never read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieInfo {
    pub name: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Local,
    Session,
}

impl StorageKind {
    pub fn js_object(&self) -> &'static str {
        match self {
            StorageKind::Local => "window.localStorage",
            StorageKind::Session => "window.sessionStorage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A resolved element the caller can act on.
#[async_trait]
pub trait PageElement: Send + Sync {
    async fn click(&self) -> Result<()>;
    /// Replace the element's value with `text`.
    async fn fill(&self, text: &str) -> Result<()>;
    /// Choose the `<option>` whose value is `value`.
    async fn select_option(&self, value: &str) -> Result<()>;
    async fn text(&self) -> Result<String>;
}

pub type ElementHandle = Arc<dyn PageElement>;

/// Page-level operations used for resolution and forensic capture.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Wait up to `timeout` for an element matching a CSS selector.
    async fn wait_for_css(
        &self,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> Result<ElementHandle>;

    /// Wait up to `timeout` for an element matching a semantic description.
    async fn find_semantic(&self, query: &SemanticQuery, timeout: Duration)
        -> Result<ElementHandle>;

    /// Full-viewport screenshot as PNG bytes.
    async fn screenshot_png(&self) -> Result<Vec<u8>>;

    /// Serialized DOM of the current document.
    async fn content(&self) -> Result<String>;

    async fn url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    async fn viewport(&self) -> Result<Viewport>;

    async fn cookies(&self) -> Result<Vec<CookieInfo>>;

    async fn storage_keys(&self, kind: StorageKind) -> Result<Vec<String>>;
}
