//! Headless-render boundary.
//!
//! Actual JavaScript execution lives in an external render service; this
//! crate only hands off navigation plus wait conditions and receives the
//! rendered result. `NoopRenderer` stands in when no engine is attached —
//! the HTTP pipeline keeps working without one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CrawlError;

/// What the renderer should wait for before snapshotting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitCondition {
    #[default]
    Load,
    NetworkIdle,
    Selector(String),
}

/// A render hand-off.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub wait_for: WaitCondition,
    pub timeout: Duration,
    pub capture_screenshot: bool,
}

impl RenderRequest {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            wait_for: WaitCondition::Load,
            timeout: Duration::from_secs(30),
            capture_screenshot: false,
        }
    }
}

/// Result handed back by the render service.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub html: String,
    pub dom_state: serde_json::Value,
    pub screenshot: Option<Vec<u8>>,
    pub load_time: Duration,
}

/// A render engine capable of executing page JavaScript.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedPage, CrawlError>;
}

/// Stand-in used when no render service is attached.
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedPage, CrawlError> {
        Err(CrawlError::RenderUnavailable(format!(
            "no render engine attached for {}",
            request.url
        )))
    }
}
