//! Contract for everything the host needs from the browser side: which tab is in front, whether
//! its page is visible, and the two fire-and-forget instructions (redirect, notify).
//! [crate::daemon::host::bridge::HostBrowser] implements it over native messaging.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TabId = i64;
pub type WindowId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub tab_id: TabId,
    pub window_id: WindowId,
    /// Current URL of the tab. For example `https://www.youtube.com/watch?v=...`
    pub url: String,
}

#[derive(Debug, Error)]
pub enum BrowserError {
    /// The tab or page disappeared while being queried. Callers treat this as the end of a
    /// session rather than a failure.
    #[error("tab {0} no longer exists")]
    TabGone(TabId),

    #[error("browser call failed: {0}")]
    Failed(String),

    #[error("browser did not answer within {0:?}")]
    Timeout(Duration),

    #[error("browser connection closed")]
    Disconnected,
}

/// Structured notification. The extension composes the user-facing text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    DailyBudget {
        threshold_percent: u8,
        used_seconds: u64,
        budget_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    LimitReached {
        domain: String,
        time_limit_minutes: u32,
    },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserApi: Send + Sync {
    /// Active tab of the window that currently holds OS focus, if any.
    async fn focused_active_tab(&self) -> Result<Option<TabInfo>, BrowserError>;

    /// Asks the page-side script whether the document reports itself visible.
    async fn check_visibility(&self, tab_id: TabId) -> Result<bool, BrowserError>;

    async fn redirect(&self, tab_id: TabId, url: String) -> Result<(), BrowserError>;

    async fn notify(&self, notification: Notification) -> Result<(), BrowserError>;
}
