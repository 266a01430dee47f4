//! Capability interface over the live chat page.
//!
//! The page is treated as an opaque, asynchronously mutating surface. Callers
//! only ever locate elements, read them, click them, type into them, and run
//! scripts. Everything session specific stays behind [`UiSurface`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Opaque reference to an element observed on the page.
///
/// A handle may go stale at any time (the page re-renders, navigates, or
/// replaces the node). Reads through a stale handle fail rather than return
/// bogus data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed form of a locator string.
///
/// `text:<fragment>` matches any element whose own text contains the
/// fragment; everything else is a CSS selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator<'a> {
    Css(&'a str),
    Text(&'a str),
}

impl<'a> Locator<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.strip_prefix("text:") {
            Some(fragment) => Locator::Text(fragment),
            None => Locator::Css(raw.strip_prefix("css:").unwrap_or(raw)),
        }
    }
}

/// Everything the turn engine needs from the automation session.
#[async_trait]
pub trait UiSurface: Send + Sync {
    /// Load `url` and wait for the document to settle.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Reload the current document.
    async fn reload(&self) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// First element matching `locator`, waiting up to `timeout` for it to appear.
    async fn locate(&self, locator: &str, timeout: Duration) -> Result<Option<ElementHandle>>;

    /// All elements matching `locator` in document order, waiting up to
    /// `timeout` for at least one to appear.
    async fn locate_all(&self, locator: &str, timeout: Duration) -> Result<Vec<ElementHandle>>;

    /// Rendered text of the element.
    async fn text(&self, element: &ElementHandle) -> Result<String>;

    async fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>>;

    async fn click(&self, element: &ElementHandle) -> Result<()>;

    /// Focus the element and insert `text` into it verbatim.
    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()>;

    /// Focus the element and press Enter.
    async fn press_enter(&self, element: &ElementHandle) -> Result<()>;

    /// Evaluate `code` as the body of an async function and return its
    /// JSON-serialisable result.
    async fn run_script(&self, code: &str) -> Result<Value>;

    /// Forget every handle returned so far. Held handles go stale.
    async fn release_handles(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_defaults_to_css() {
        assert_eq!(
            Locator::parse("button[aria-label*=\"Send\"]"),
            Locator::Css("button[aria-label*=\"Send\"]")
        );
        assert_eq!(Locator::parse("css:.error-message"), Locator::Css(".error-message"));
    }

    #[test]
    fn locator_text_prefix() {
        assert_eq!(Locator::parse("text:出现了点问题"), Locator::Text("出现了点问题"));
    }
}
