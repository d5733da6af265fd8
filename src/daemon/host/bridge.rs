//! [BrowserApi] over native messaging. Queries go out as `CALL` frames and are answered by
//! `REPLY` frames that the host routes back through [PendingReplies].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::browser_api::{BrowserApi, BrowserError, Notification, TabId, TabInfo};

use super::frames::{BrowserCall, OutboundFrame, ReplyError};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

type ReplySender = oneshot::Sender<Result<Value, ReplyError>>;

/// Calls waiting for their reply, keyed by call id.
#[derive(Default)]
pub struct PendingReplies {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, ReplySender>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> (u64, oneshot::Receiver<Result<Value, ReplyError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(id, sender);
        (id, receiver)
    }

    fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Hands a reply to its caller. Returns false for unknown ids, typically replies that arrived
    /// after the call timed out.
    pub fn resolve(&self, id: u64, reply: Result<Value, ReplyError>) -> bool {
        match self.lock().remove(&id) {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ReplySender>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct HostBrowser {
    outbound: mpsc::Sender<OutboundFrame>,
    pending: Arc<PendingReplies>,
    timeout: Duration,
}

impl HostBrowser {
    pub fn new(
        outbound: mpsc::Sender<OutboundFrame>,
        pending: Arc<PendingReplies>,
        timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            pending,
            timeout,
        }
    }

    async fn call(&self, call: BrowserCall) -> Result<Value, BrowserError> {
        let (id, receiver) = self.pending.register();
        if self
            .outbound
            .send(OutboundFrame::Call { id, call })
            .await
            .is_err()
        {
            self.pending.forget(id);
            return Err(BrowserError::Disconnected);
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(error.into_browser_error(call.tab_id())),
            Ok(Err(_)) => Err(BrowserError::Disconnected),
            Err(_) => {
                self.pending.forget(id);
                debug!("Call {id} {call:?} timed out");
                Err(BrowserError::Timeout(self.timeout))
            }
        }
    }

    async fn send(&self, frame: OutboundFrame) -> Result<(), BrowserError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BrowserError::Disconnected)
    }
}

#[async_trait]
impl BrowserApi for HostBrowser {
    async fn focused_active_tab(&self) -> Result<Option<TabInfo>, BrowserError> {
        let value = self.call(BrowserCall::QueryActiveTab).await?;
        serde_json::from_value(value).map_err(|e| BrowserError::Failed(e.to_string()))
    }

    async fn check_visibility(&self, tab_id: TabId) -> Result<bool, BrowserError> {
        let value = self.call(BrowserCall::CheckVisibility { tab_id }).await?;
        value
            .as_bool()
            .ok_or_else(|| BrowserError::Failed(format!("expected a boolean, got {value}")))
    }

    async fn redirect(&self, tab_id: TabId, url: String) -> Result<(), BrowserError> {
        self.send(OutboundFrame::Redirect { tab_id, url }).await
    }

    async fn notify(&self, notification: Notification) -> Result<(), BrowserError> {
        self.send(OutboundFrame::Notify { notification }).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn browser(capacity: usize) -> (HostBrowser, mpsc::Receiver<OutboundFrame>, Arc<PendingReplies>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let pending = Arc::new(PendingReplies::new());
        let browser = HostBrowser::new(sender, pending.clone(), DEFAULT_CALL_TIMEOUT);
        (browser, receiver, pending)
    }

    #[tokio::test]
    async fn test_reply_resolves_matching_call() {
        let (browser, mut outbound, pending) = browser(4);

        let answer = async {
            let Some(OutboundFrame::Call { id, call }) = outbound.recv().await else {
                panic!("expected a call frame");
            };
            assert_eq!(call, BrowserCall::QueryActiveTab);
            assert!(pending.resolve(
                id,
                Ok(json!({"tabId": 3, "windowId": 1, "url": "https://a.com"}))
            ));
        };

        let (tab, ()) = tokio::join!(browser.focused_active_tab(), answer);
        assert_eq!(
            tab.unwrap(),
            Some(TabInfo {
                tab_id: 3,
                window_id: 1,
                url: "https://a.com".into()
            })
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_null_reply_means_no_focused_tab() {
        let (browser, mut outbound, pending) = browser(4);
        let answer = async {
            if let Some(OutboundFrame::Call { id, .. }) = outbound.recv().await {
                pending.resolve(id, Ok(Value::Null));
            }
        };
        let (tab, ()) = tokio::join!(browser.focused_active_tab(), answer);
        assert_eq!(tab.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tab_gone_reply_maps_to_tab_gone_error() {
        let (browser, mut outbound, pending) = browser(4);
        let answer = async {
            if let Some(OutboundFrame::Call { id, .. }) = outbound.recv().await {
                pending.resolve(id, Err(ReplyError::TabGone));
            }
        };
        let (visible, ()) = tokio::join!(browser.check_visibility(8), answer);
        assert!(matches!(visible, Err(BrowserError::TabGone(8))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out_and_late_reply_is_dropped() {
        let (browser, mut outbound, pending) = browser(4);

        let visible = browser.check_visibility(1).await;
        assert!(matches!(visible, Err(BrowserError::Timeout(_))));
        assert!(pending.is_empty());

        let Some(OutboundFrame::Call { id, .. }) = outbound.recv().await else {
            panic!("expected a call frame");
        };
        assert!(!pending.resolve(id, Ok(json!(true))));
    }

    #[tokio::test]
    async fn test_closed_writer_reports_disconnected() {
        let (browser, outbound, _) = browser(4);
        drop(outbound);

        assert!(matches!(
            browser.redirect(1, "https://x".into()).await,
            Err(BrowserError::Disconnected)
        ));
        assert!(matches!(
            browser.focused_active_tab().await,
            Err(BrowserError::Disconnected)
        ));
    }
}
