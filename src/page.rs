//! The browser seen from the loop: a page handle and something that hands them out.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Text and link targets of one element matched by a selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub text: String,
    pub links: Vec<String>,
}

/// Page-like handle onto a live browser tab.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()>;

    async fn click(&self, selector: &str) -> Result<()>;

    /// Click the first `selector` match whose trimmed text equals `text`, ignoring case.
    async fn click_with_text(&self, selector: &str, text: &str, timeout: Duration) -> Result<()>;

    /// Wait until some `selector` match contains `text`, ignoring case.
    async fn wait_for_text(&self, selector: &str, text: &str, timeout: Duration) -> Result<()>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;

    /// Up to `limit` matches of `selector`, in document order.
    async fn snapshot_all(&self, selector: &str, limit: usize) -> Result<Vec<ElementSnapshot>>;

    async fn url(&self) -> Result<String>;

    /// Full serialized markup of the current document.
    async fn html(&self) -> Result<String>;

    /// Full-page PNG screenshot.
    async fn screenshot_png(&self) -> Result<Vec<u8>>;
}

/// Opens and releases the browser session bound to a profile.
#[async_trait]
pub trait PageProvider: Send + Sync {
    async fn open(&self, profile_id: &str) -> Result<Box<dyn Page>>;

    /// Tear down the session. Called exactly once for every successful `open`.
    async fn release(&self, profile_id: &str, page: Box<dyn Page>) -> Result<()>;
}
