//! Owner of all live state. Browser events, requests, scheduler triggers and grant timers all
//! arrive as [Command]s on one channel and are handled one at a time, so there is exactly one
//! writer for the tracker, the pending buffer, the grants and the rule set.

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    browser_api::{BrowserApi, BrowserError, Notification, TabId},
    utils::{clock::Clock, time::until},
};

use super::{
    alerts::newly_crossed_threshold,
    error::ValidationError,
    policy::{
        grants::{GrantManager, GrantTicket},
        redirect::blocked_page_url,
        rules::{AccessDecision, BlockReason, Rule, RuleEngine},
    },
    protocol::{BrowserEvent, Outcome, Request, Response, TempAccessStatus, WINDOW_ID_NONE},
    scheduler::Trigger,
    settings::{Settings, SettingsPatch},
    storage::document_store::DocumentStore,
    tracking::{
        domain::{extract_domain, normalize_domain_input, DomainClassifier},
        tracker::{StoppedSession, TabActivityTracker},
    },
    usage::UsageAggregator,
};

const MAX_GRANT_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug)]
pub enum Command {
    Browser(BrowserEvent),
    Request {
        request: Request,
        respond: oneshot::Sender<Response>,
    },
    Trigger(Trigger),
    /// Fired by the cleanup timer of a grant.
    GrantExpired { domain: String, ticket: GrantTicket },
}

pub struct Coordinator<S> {
    receiver: mpsc::Receiver<Command>,
    /// Used by grant timers. Weak so that the channel closes once the host and the scheduler
    /// are gone.
    timers: mpsc::WeakSender<Command>,
    store: S,
    browser: Box<dyn BrowserApi>,
    time_provider: Arc<dyn Clock>,
    shutdown: CancellationToken,

    settings: Settings,
    classifier: DomainClassifier,
    tracker: TabActivityTracker,
    aggregator: UsageAggregator,
    rules: RuleEngine,
    grants: GrantManager,
    /// Last main-frame URL seen per tab, for redirects issued outside a navigation.
    tab_urls: HashMap<TabId, String>,
}

impl<S: DocumentStore> Coordinator<S> {
    /// Restores settings and rules from the store. Grants and pending usage always start empty.
    pub async fn load(
        receiver: mpsc::Receiver<Command>,
        timers: mpsc::WeakSender<Command>,
        store: S,
        browser: Box<dyn BrowserApi>,
        time_provider: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let document = store.load().await.context("Failed to load store")?;
        let settings = document.settings.clone();
        let rules = RuleEngine::from_document(&document);
        info!("Loaded {} rules", rules.len());

        Ok(Self {
            receiver,
            timers,
            store,
            browser,
            time_provider,
            shutdown,
            classifier: DomainClassifier::new(settings.excluded_domains.clone()),
            settings,
            tracker: TabActivityTracker::new(),
            aggregator: UsageAggregator::new(),
            rules,
            grants: GrantManager::new(),
            tab_urls: HashMap::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Executes the command loop. On shutdown every session is stopped and the buffer flushed.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let command = select! {
                biased;
                command = self.receiver.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            };
            self.handle(command).await;
        }
        self.finish().await
    }

    async fn finish(&mut self) -> Result<()> {
        self.stop_all();
        let written = self
            .aggregator
            .flush(&self.store, &self.rules)
            .await
            .context("Final flush failed")?;
        info!("Coordinator stopped, final flush wrote {written}s");
        Ok(())
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Browser(event) => {
                let span = info_span!("Browser event");
                debug!("Handling {event:?}");
                if let Err(e) = self.on_event(event).instrument(span).await {
                    warn!("Failed to handle browser event {e:?}");
                }
            }
            Command::Request { request, respond } => {
                let span = info_span!("Request");
                debug!("Handling {request:?}");
                let response = self.on_request(request).instrument(span).await;
                if respond.send(response).is_err() {
                    debug!("Requester went away before the response");
                }
            }
            Command::Trigger(trigger) => self.on_trigger(trigger).await,
            Command::GrantExpired { domain, ticket } => {
                let now = self.now();
                if self.grants.expire(&domain, ticket, now) {
                    if let Err(e) = self.enforce_open_sessions(Some(&domain)).await {
                        warn!("Failed to enforce {domain} after its grant expired {e:?}");
                    }
                }
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.time_provider.time()
    }

    fn today(&self) -> NaiveDate {
        self.time_provider.today()
    }

    // Tracking

    async fn on_event(&mut self, event: BrowserEvent) -> Result<()> {
        match event {
            BrowserEvent::TabActivated { tab_id, .. } => {
                debug!("Tab {tab_id} activated");
                self.follow_focus().await
            }
            BrowserEvent::NavigationCompleted {
                tab_id,
                url,
                frame_id,
            } => {
                if frame_id != 0 {
                    return Ok(());
                }
                self.tab_urls.insert(tab_id, url.clone());
                self.on_navigation(tab_id, &url).await
            }
            BrowserEvent::TabRemoved { tab_id } => {
                self.tab_urls.remove(&tab_id);
                self.stop_tab(tab_id);
                Ok(())
            }
            BrowserEvent::WindowFocusChanged { window_id } => match window_id {
                None | Some(WINDOW_ID_NONE) => {
                    debug!("Browser lost focus");
                    self.stop_all();
                    Ok(())
                }
                Some(_) => self.follow_focus().await,
            },
        }
    }

    /// Re-resolves the active tab of the focused window and tracks it.
    async fn follow_focus(&mut self) -> Result<()> {
        match self.browser.focused_active_tab().await? {
            Some(tab) => {
                self.tab_urls.insert(tab.tab_id, tab.url.clone());
                self.enter_tab(tab.tab_id, &tab.url).await
            }
            None => {
                self.stop_all();
                Ok(())
            }
        }
    }

    /// `tab_id` is now the foreground tab showing `url`.
    async fn enter_tab(&mut self, tab_id: TabId, url: &str) -> Result<()> {
        let Some(domain) = self.classifier.trackable_domain(url) else {
            self.stop_all();
            return Ok(());
        };
        if self.enforce(tab_id, url, &domain).await? {
            self.stop_all();
            return Ok(());
        }
        let running = self
            .tracker
            .session(tab_id)
            .is_some_and(|session| session.is_active && session.domain == domain);
        if !running {
            self.begin(tab_id, &domain);
        }
        Ok(())
    }

    async fn on_navigation(&mut self, tab_id: TabId, url: &str) -> Result<()> {
        let Some(domain) = self.classifier.trackable_domain(url) else {
            self.stop_tab(tab_id);
            return Ok(());
        };
        if self.enforce(tab_id, url, &domain).await? {
            return Ok(());
        }
        if self
            .tracker
            .session(tab_id)
            .is_some_and(|session| session.domain == domain)
        {
            return Ok(());
        }

        let in_front = match self.browser.focused_active_tab().await {
            Ok(tab) => tab.is_some_and(|tab| tab.tab_id == tab_id),
            Err(e) => {
                debug!("Could not resolve focused tab {e}");
                self.tracker
                    .session(tab_id)
                    .is_some_and(|session| session.is_active)
            }
        };
        if in_front {
            self.begin(tab_id, &domain);
        } else {
            self.stop_tab(tab_id);
        }
        Ok(())
    }

    fn begin(&mut self, tab_id: TabId, domain: &str) {
        let stopped = self.tracker.start(tab_id, domain, self.now());
        self.hand_off(stopped);
    }

    fn stop_tab(&mut self, tab_id: TabId) {
        let stopped = self.tracker.stop(tab_id, self.now());
        self.hand_off(stopped);
    }

    fn stop_all(&mut self) {
        let stopped = self.tracker.stop_all(self.now());
        self.hand_off(stopped);
    }

    fn hand_off(&mut self, stopped: impl IntoIterator<Item = StoppedSession>) {
        let today = self.today();
        for StoppedSession { domain, seconds } in stopped {
            self.aggregator.add_pending(&domain, seconds, today);
        }
    }

    // Enforcement

    /// Seconds spent on `domain` today, including open sessions.
    async fn used_today(&mut self, domain: &str) -> Result<u64> {
        let today = self.today();
        let stored = self
            .aggregator
            .today_seconds(&self.store, &self.rules, domain, today)
            .await?;
        Ok(stored + self.tracker.accrued_secs(domain, self.now()))
    }

    async fn decide(&mut self, url: &str, domain: &str) -> Result<AccessDecision> {
        if self.rules.get_rule(domain).is_none() {
            return Ok(AccessDecision::ALLOW);
        }
        let used = self.used_today(domain).await?;
        Ok(self
            .rules
            .evaluate_access(url, used, &self.grants, self.now()))
    }

    /// Redirects `tab_id` away from `url` when policy says so. Returns whether it did.
    async fn enforce(&mut self, tab_id: TabId, url: &str, domain: &str) -> Result<bool> {
        let decision = self.decide(url, domain).await?;
        if !decision.should_block {
            return Ok(false);
        }
        let reason = decision.reason.unwrap_or(BlockReason::Blocked);
        self.stop_tab(tab_id);

        let target = blocked_page_url(&self.settings.block_page_url, domain, url, reason)
            .context("Block page url is invalid")?;
        match self.browser.redirect(tab_id, target).await {
            Ok(()) => info!("Blocked {domain} on tab {tab_id} ({reason:?})"),
            Err(e) => warn!("Failed to redirect tab {tab_id} away from {domain} {e}"),
        }

        let (now, today) = (self.now(), self.today());
        self.aggregator
            .record_block(&self.store, domain, reason, now, today)
            .await?;
        if reason == BlockReason::Restricted {
            self.notify_limit_reached(domain).await?;
        }
        Ok(true)
    }

    async fn notify_limit_reached(&mut self, domain: &str) -> Result<()> {
        let Some(Rule::Restricted {
            time_limit_minutes, ..
        }) = self.rules.get_rule(domain).cloned()
        else {
            return Ok(());
        };

        let mut document = self.store.load().await?;
        if !document
            .daily_notifications_sent
            .insert_for(self.today(), domain.to_owned())
        {
            return Ok(());
        }
        self.store.save(&document).await?;

        let notification = Notification::LimitReached {
            domain: domain.to_owned(),
            time_limit_minutes,
        };
        if let Err(e) = self.browser.notify(notification).await {
            warn!("Failed to notify about {domain} {e}");
        }
        Ok(())
    }

    // Triggers

    async fn on_trigger(&mut self, trigger: Trigger) {
        let result = match trigger {
            Trigger::Flush => self.flush_and_enforce().await,
            Trigger::Liveness => self.check_liveness().await,
            Trigger::DailyReset => self.daily_reset().await,
            Trigger::QuotaCheck => self.check_quota().await,
            Trigger::Cleanup => self.cleanup().await,
            Trigger::Backup => self.backup().await,
        };
        if let Err(e) = result {
            warn!("Scheduled {trigger:?} failed {e:?}");
        }
    }

    /// Persists the buffer, then cuts off a ruled site whose limit or grant ran out
    /// mid-session.
    async fn flush_and_enforce(&mut self) -> Result<()> {
        self.aggregator.flush(&self.store, &self.rules).await?;
        self.enforce_open_sessions(None).await
    }

    /// Re-evaluates accruing sessions on ruled domains, or only those on `only` when given.
    async fn enforce_open_sessions(&mut self, only: Option<&str>) -> Result<()> {
        for tab_id in self.tracker.active_tabs() {
            let Some(domain) = self.tracker.session(tab_id).map(|s| s.domain.clone()) else {
                continue;
            };
            if only.is_some_and(|only| only != domain) || self.rules.get_rule(&domain).is_none() {
                continue;
            }
            let url = self
                .tab_urls
                .get(&tab_id)
                .cloned()
                .unwrap_or_else(|| format!("https://{domain}/"));
            self.enforce(tab_id, &url, &domain).await?;
        }
        Ok(())
    }

    /// Confirms that the accruing session still belongs to the foreground tab and that its
    /// page is visible.
    async fn check_liveness(&mut self) -> Result<()> {
        for tab_id in self.tracker.active_tabs() {
            match self.browser.focused_active_tab().await? {
                Some(tab) if tab.tab_id == tab_id => {}
                Some(tab) => {
                    debug!("Foreground moved from tab {tab_id} to {}", tab.tab_id);
                    self.tab_urls.insert(tab.tab_id, tab.url.clone());
                    return self.enter_tab(tab.tab_id, &tab.url).await;
                }
                None => {
                    self.stop_all();
                    return Ok(());
                }
            }

            match self.browser.check_visibility(tab_id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.tracker.pause(tab_id, self.now());
                }
                Err(BrowserError::TabGone(_)) => {
                    debug!("Tab {tab_id} is gone");
                    self.tab_urls.remove(&tab_id);
                    self.stop_tab(tab_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn daily_reset(&mut self) -> Result<()> {
        let mut document = self.store.load().await?;
        document.quota_warnings_sent.clear();
        document.daily_notifications_sent.clear();
        self.store.save(&document).await?;
        info!("Cleared daily notification flags");
        Ok(())
    }

    async fn check_quota(&mut self) -> Result<()> {
        let Some(budget_minutes) = self.settings.daily_budget_minutes else {
            return Ok(());
        };
        let budget_seconds = u64::from(budget_minutes) * 60;
        let today = self.today();
        let used_seconds = self
            .aggregator
            .total_today(&self.store, &self.rules, today)
            .await?;

        let mut document = self.store.load().await?;
        let Some(threshold_percent) = newly_crossed_threshold(
            &mut document.quota_warnings_sent,
            today,
            used_seconds,
            budget_seconds,
        ) else {
            return Ok(());
        };
        self.store.save(&document).await?;

        info!("Daily budget {threshold_percent}% reached");
        let notification = Notification::DailyBudget {
            threshold_percent,
            used_seconds,
            budget_seconds,
        };
        if let Err(e) = self.browser.notify(notification).await {
            warn!("Failed to send budget notification {e}");
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.aggregator
            .purge_history(
                &self.store,
                self.today(),
                self.settings.retention_days,
                self.now(),
            )
            .await
    }

    async fn backup(&mut self) -> Result<()> {
        if let Err(e) = self.aggregator.flush(&self.store, &self.rules).await {
            warn!("Flush before backup failed {e:?}");
        }
        let mut document = self.store.load().await?;
        document.push_backup(self.now())?;
        self.store.save(&document).await?;
        info!("Stored backup, {} kept", document.backups.len());
        Ok(())
    }

    // Requests

    async fn on_request(&mut self, request: Request) -> Response {
        match request {
            Request::GetUsageData => {
                let today = self.today();
                match self
                    .aggregator
                    .usage_view(&self.store, &self.rules, today)
                    .await
                {
                    Ok(view) => Response::Usage(view),
                    Err(e) => Response::Outcome(Outcome::failed(e)),
                }
            }
            Request::CheckAccess { url, domain } => {
                let Some(url) = url.or_else(|| domain.map(|domain| format!("https://{domain}")))
                else {
                    return Response::Outcome(Outcome::failed(ValidationError::invalid(
                        "url",
                        "either url or domain is required",
                    )));
                };
                let Some(domain) = extract_domain(&url) else {
                    return Response::Access(AccessDecision::ALLOW);
                };
                match self.decide(&url, &domain).await {
                    Ok(decision) => Response::Access(decision),
                    Err(e) => Response::Outcome(Outcome::failed(e)),
                }
            }
            Request::AddSiteRule {
                domain,
                rule_type,
                time_limit_minutes,
            } => Response::Outcome(
                match Rule::parse(&domain, rule_type, time_limit_minutes) {
                    Ok(rule) => self.rules.add_rule(rule, &self.store).await.into(),
                    Err(e) => Outcome::failed(e),
                },
            ),
            Request::RemoveSiteRule { domain } => Response::Outcome(
                match normalize_domain_input(&domain) {
                    Ok(domain) => self
                        .rules
                        .remove_rule(&domain, &self.store)
                        .await
                        .map(|_| ())
                        .into(),
                    Err(e) => Outcome::failed(e),
                },
            ),
            Request::GetSiteRules => Response::Rules(self.rules.listing()),
            Request::RequestTempAccess { domain, duration } => {
                Response::TempAccess(self.request_temp_access(&domain, duration).await)
            }
            Request::CheckTempAccess { domain } => {
                Response::TempAccess(match normalize_domain_input(&domain) {
                    Ok(domain) => self.temp_access_status(&domain),
                    Err(e) => TempAccessStatus::rejected(e),
                })
            }
            Request::RevokeTempAccess { domain } => {
                Response::TempAccess(match normalize_domain_input(&domain) {
                    Ok(domain) => {
                        if self.grants.revoke(&domain) {
                            info!("Revoked temporary access to {domain}");
                        }
                        self.temp_access_status(&domain)
                    }
                    Err(e) => TempAccessStatus::rejected(e),
                })
            }
            Request::GetSettings => Response::Settings(self.settings.clone()),
            Request::UpdateSettings { settings } => {
                Response::Outcome(self.update_settings(settings).await.into())
            }
        }
    }

    fn temp_access_status(&mut self, domain: &str) -> TempAccessStatus {
        let now = self.now();
        TempAccessStatus {
            has_access: self.grants.has_access(domain, now),
            remaining_time: self.grants.remaining_ms(domain, now),
            error: None,
        }
    }

    async fn request_temp_access(&mut self, domain: &str, duration_ms: Option<u64>) -> TempAccessStatus {
        let domain = match normalize_domain_input(domain) {
            Ok(domain) => domain,
            Err(e) => return TempAccessStatus::rejected(e),
        };
        let duration_ms = duration_ms
            .unwrap_or(u64::from(self.settings.temp_access_minutes) * 60 * 1000);
        if !(1..=MAX_GRANT_DURATION_MS).contains(&duration_ms) {
            return TempAccessStatus::rejected(ValidationError::invalid(
                "duration",
                format!("must be 1-{MAX_GRANT_DURATION_MS} ms"),
            ));
        }
        // Bounded by the range check above.
        let duration = Duration::milliseconds(i64::try_from(duration_ms).unwrap_or(i64::MAX));

        let now = self.now();
        let ticket = self.grants.grant(&domain, duration, now);
        self.schedule_expiry(domain.clone(), ticket, now);
        info!("Granted temporary access to {domain} for {duration_ms}ms");

        if let Err(e) = self.aggregator.record_temp_access(&self.store, &domain).await {
            warn!("Failed to count temporary access to {domain} {e:?}");
        }
        self.temp_access_status(&domain)
    }

    /// Best-effort cleanup. Expired grants are also dropped lazily on every check.
    fn schedule_expiry(&self, domain: String, ticket: GrantTicket, now: DateTime<Utc>) {
        let Some(sender) = self.timers.upgrade() else {
            return;
        };
        let delay = until(now, ticket.expires_at);
        let time_provider = self.time_provider.clone();
        tokio::spawn(async move {
            time_provider.sleep(delay).await;
            if sender
                .send(Command::GrantExpired { domain, ticket })
                .await
                .is_err()
            {
                debug!("Coordinator gone before grant expiry");
            }
        });
    }

    async fn update_settings(&mut self, patch: SettingsPatch) -> Result<()> {
        let settings = self.settings.patched(patch)?;
        let mut document = self.store.load().await?;
        document.settings = settings.clone();
        self.store.save(&document).await?;

        self.classifier = DomainClassifier::new(settings.excluded_domains.clone());
        if settings.backup_time != self.settings.backup_time {
            info!("Backup time changes to {} after restart", settings.backup_time);
        }
        self.settings = settings;
        Ok(())
    }
}
