use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use super::{
    policy::rules::{BlockReason, RuleEngine},
    storage::{
        document_store::DocumentStore,
        entities::{BlockEvent, UsageClass},
    },
};

pub mod view;

use view::{DomainUsage, UsageView};

/// Block events are kept for this long, independent of the usage retention setting.
pub const BLOCK_STATS_RETENTION: Duration = Duration::days(30);

/// Buffers measured seconds and moves them into the store. It is also the only writer of usage
/// records, so block counters and purges go through here as well.
#[derive(Debug, Default)]
pub struct UsageAggregator {
    /// Keyed by domain and the local date the interval ended on.
    pending: HashMap<(String, NaiveDate), u64>,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&mut self, domain: &str, seconds: u64, date: NaiveDate) {
        if seconds == 0 {
            return;
        }
        *self.pending.entry((domain.to_owned(), date)).or_default() += seconds;
    }

    #[cfg(test)]
    pub fn pending_seconds(&self, domain: &str) -> u64 {
        self.pending
            .iter()
            .filter(|((pending_domain, _), _)| pending_domain == domain)
            .map(|(_, seconds)| seconds)
            .sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Moves the buffer into the store. The buffer is taken in one step before the first
    /// suspension point; if persisting fails the batch is merged back for the next attempt.
    /// Returns the number of seconds written.
    pub async fn flush<S: DocumentStore + ?Sized>(
        &mut self,
        store: &S,
        rules: &RuleEngine,
    ) -> Result<u64> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(&mut self.pending);
        match Self::persist(store, rules, &batch).await {
            Ok(()) => {
                let total = batch.values().sum();
                debug!("Flushed {total}s across {} buckets", batch.len());
                Ok(total)
            }
            Err(e) => {
                for ((domain, date), seconds) in batch {
                    self.add_pending(&domain, seconds, date);
                }
                Err(e)
            }
        }
    }

    async fn persist<S: DocumentStore + ?Sized>(
        store: &S,
        rules: &RuleEngine,
        batch: &HashMap<(String, NaiveDate), u64>,
    ) -> Result<()> {
        let mut document = store.load().await?;
        for ((domain, date), seconds) in batch {
            let class = match rules.get_rule(domain) {
                Some(_) => UsageClass::Restricted,
                None => UsageClass::General,
            };
            document
                .usage
                .entry(domain.clone())
                .or_default()
                .add(*date, *seconds, class);
        }
        store.save(&document).await
    }

    /// Seconds recorded on `domain` for `today`, flushing first so the answer includes every
    /// stopped interval. Seconds still buffered after a failed flush are counted too.
    pub async fn today_seconds<S: DocumentStore + ?Sized>(
        &mut self,
        store: &S,
        rules: &RuleEngine,
        domain: &str,
        today: NaiveDate,
    ) -> Result<u64> {
        if let Err(e) = self.flush(store, rules).await {
            warn!("Flush before reading usage of {domain} failed {e:?}");
        }
        let document = store.load().await?;
        let stored = document
            .usage
            .get(domain)
            .map_or(0, |record| record.seconds_on(today));
        let buffered = self
            .pending
            .get(&(domain.to_owned(), today))
            .copied()
            .unwrap_or(0);
        Ok(stored + buffered)
    }

    /// Total seconds across all domains for `today`.
    pub async fn total_today<S: DocumentStore + ?Sized>(
        &mut self,
        store: &S,
        rules: &RuleEngine,
        today: NaiveDate,
    ) -> Result<u64> {
        self.flush(store, rules).await?;
        Ok(store.load().await?.total_on(today))
    }

    pub async fn usage_view<S: DocumentStore + ?Sized>(
        &mut self,
        store: &S,
        rules: &RuleEngine,
        today: NaiveDate,
    ) -> Result<UsageView> {
        if let Err(e) = self.flush(store, rules).await {
            warn!("Flush before building usage view failed {e:?}");
        }
        let document = store.load().await?;
        let domains = document
            .usage
            .iter()
            .map(|(domain, record)| (domain.clone(), DomainUsage::from_record(record, today)))
            .collect();
        Ok(UsageView {
            date: today,
            total_today: document.total_on(today),
            domains,
        })
    }

    pub async fn record_block<S: DocumentStore + ?Sized>(
        &self,
        store: &S,
        domain: &str,
        reason: BlockReason,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<()> {
        let mut document = store.load().await?;
        document
            .usage
            .entry(domain.to_owned())
            .or_default()
            .record_block(today);
        document.block_stats.events.push(BlockEvent {
            domain: domain.to_owned(),
            reason,
            timestamp: now,
        });
        store.save(&document).await
    }

    pub async fn record_temp_access<S: DocumentStore + ?Sized>(
        &self,
        store: &S,
        domain: &str,
    ) -> Result<()> {
        let mut document = store.load().await?;
        document
            .usage
            .entry(domain.to_owned())
            .or_default()
            .temp_access_count += 1;
        store.save(&document).await
    }

    /// Drops day buckets older than the retention horizon and stale block events. Lifetime
    /// counters stay.
    pub async fn purge_history<S: DocumentStore + ?Sized>(
        &self,
        store: &S,
        today: NaiveDate,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut document = store.load().await?;
        let (buckets, events) =
            document.purge_history(today, retention_days, now, BLOCK_STATS_RETENTION);
        if buckets == 0 && events == 0 {
            debug!("Nothing to purge");
            return Ok(());
        }
        store.save(&document).await?;
        info!("Purged {buckets} day buckets and {events} block events");
        Ok(())
    }
}
