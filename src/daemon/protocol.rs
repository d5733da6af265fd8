//! Messages exchanged with the extension: browser events and requests coming in, responses
//! going out.

use serde::{Deserialize, Serialize};

use crate::browser_api::{TabId, WindowId};

use super::{
    policy::rules::{AccessDecision, RuleKind, RuleListing},
    settings::{Settings, SettingsPatch},
    usage::view::UsageView,
};

/// Window id the browser reports when none of its windows has focus.
pub const WINDOW_ID_NONE: WindowId = -1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrowserEvent {
    #[serde(rename_all = "camelCase")]
    TabActivated { tab_id: TabId, window_id: WindowId },
    #[serde(rename_all = "camelCase")]
    NavigationCompleted {
        tab_id: TabId,
        url: String,
        /// 0 for the top-level frame.
        #[serde(default)]
        frame_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    TabRemoved { tab_id: TabId },
    #[serde(rename_all = "camelCase")]
    WindowFocusChanged { window_id: Option<WindowId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    GetUsageData,
    #[serde(rename_all = "camelCase")]
    CheckAccess {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        domain: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AddSiteRule {
        domain: String,
        rule_type: RuleKind,
        #[serde(default)]
        time_limit_minutes: Option<u32>,
    },
    RemoveSiteRule {
        domain: String,
    },
    GetSiteRules,
    RequestTempAccess {
        domain: String,
        /// Milliseconds.
        #[serde(default)]
        duration: Option<u64>,
    },
    CheckTempAccess {
        domain: String,
    },
    RevokeTempAccess {
        domain: String,
    },
    GetSettings,
    UpdateSettings {
        settings: SettingsPatch,
    },
}

/// Result of a user-initiated change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl From<anyhow::Result<()>> for Outcome {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Outcome::ok(),
            Err(e) => Outcome::failed(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TempAccessStatus {
    pub has_access: bool,
    /// Milliseconds.
    pub remaining_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TempAccessStatus {
    pub fn rejected(error: impl ToString) -> Self {
        Self {
            has_access: false,
            remaining_time: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Usage(UsageView),
    Access(AccessDecision),
    Outcome(Outcome),
    Rules(RuleListing),
    TempAccess(TempAccessStatus),
    Settings(Settings),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_requests_parse_from_extension_shape() {
        let request: Request = serde_json::from_value(json!({
            "type": "ADD_SITE_RULE",
            "domain": "youtube.com",
            "ruleType": "restricted",
            "timeLimitMinutes": 30
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::AddSiteRule {
                domain: "youtube.com".into(),
                rule_type: RuleKind::Restricted,
                time_limit_minutes: Some(30)
            }
        );

        let request: Request =
            serde_json::from_value(json!({"type": "CHECK_ACCESS", "url": "https://a.com"}))
                .unwrap();
        assert_eq!(
            request,
            Request::CheckAccess {
                url: Some("https://a.com".into()),
                domain: None
            }
        );

        let request: Request = serde_json::from_value(json!({"type": "GET_SITE_RULES"})).unwrap();
        assert_eq!(request, Request::GetSiteRules);
    }

    #[test]
    fn test_events_parse() {
        let event: BrowserEvent = serde_json::from_value(json!({
            "type": "NAVIGATION_COMPLETED", "tabId": 4, "url": "https://a.com"
        }))
        .unwrap();
        assert_eq!(
            event,
            BrowserEvent::NavigationCompleted {
                tab_id: 4,
                url: "https://a.com".into(),
                frame_id: 0
            }
        );

        let event: BrowserEvent =
            serde_json::from_value(json!({"type": "WINDOW_FOCUS_CHANGED", "windowId": null}))
                .unwrap();
        assert_eq!(event, BrowserEvent::WindowFocusChanged { window_id: None });
    }

    #[test]
    fn test_responses_serialize_flat() {
        let json = serde_json::to_value(Response::Outcome(Outcome::failed("Invalid domain")))
            .unwrap();
        assert_eq!(json, json!({"success": false, "error": "Invalid domain"}));

        let json = serde_json::to_value(Response::TempAccess(TempAccessStatus {
            has_access: true,
            remaining_time: 300_000,
            error: None,
        }))
        .unwrap();
        assert_eq!(json, json!({"hasAccess": true, "remainingTime": 300000}));
    }
}
