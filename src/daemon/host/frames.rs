use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    browser_api::{BrowserError, Notification, TabId},
    daemon::protocol::{BrowserEvent, Response},
};

/// Everything the extension can send to the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundFrame {
    Event {
        event: BrowserEvent,
    },
    /// The body is decoded by the host so that a malformed request can still be answered.
    #[serde(rename_all = "camelCase")]
    Request { request_id: u64, request: Value },
    /// Answer to a [OutboundFrame::Call].
    #[serde(rename_all = "camelCase")]
    Reply {
        reply_to: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ReplyError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyError {
    TabGone,
    Failed { message: String },
}

impl ReplyError {
    pub fn into_browser_error(self, tab_id: Option<TabId>) -> BrowserError {
        match self {
            ReplyError::TabGone => BrowserError::TabGone(tab_id.unwrap_or_default()),
            ReplyError::Failed { message } => BrowserError::Failed(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Response { request_id: u64, response: Response },
    Call { id: u64, call: BrowserCall },
    #[serde(rename_all = "camelCase")]
    Redirect { tab_id: TabId, url: String },
    Notify { notification: Notification },
}

/// Queries the host cannot answer on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "method", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrowserCall {
    QueryActiveTab,
    #[serde(rename_all = "camelCase")]
    CheckVisibility { tab_id: TabId },
}

impl BrowserCall {
    pub fn tab_id(&self) -> Option<TabId> {
        match self {
            BrowserCall::QueryActiveTab => None,
            BrowserCall::CheckVisibility { tab_id } => Some(*tab_id),
        }
    }
}
