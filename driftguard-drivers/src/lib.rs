//! Driver layer: the browser capability injected into the resilience engine.
//!
//! - [`page::BrowserPage`] / [`page::PageElement`]: the capability traits
//! - [`semantic`]: role/label/text/placeholder lookups compiled to XPath
//! - [`webdriver::WebDriverSession`] / [`webdriver::WebDriverPage`]: fantoccini-backed implementation
pub mod page;
pub mod semantic;
pub mod webdriver;

pub use page::{
    BrowserPage, CookieInfo, ElementHandle, ElementState, PageElement, SemanticQuery,
    StorageKind, Viewport,
};
