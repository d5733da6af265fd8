use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    daemon::{policy::rules::BlockReason, settings::Settings},
    utils::time::{bucket_key_date, date_to_bucket_key},
};

pub const MAX_BACKUPS: usize = 7;

/// Whether an interval was spent on a site governed by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageClass {
    General,
    Restricted,
}

impl UsageClass {
    fn suffix(self) -> &'static str {
        match self {
            UsageClass::General => "general",
            UsageClass::Restricted => "restricted",
        }
    }
}

/// Persisted usage of one domain. Day buckets are stored as flat keys next to the lifetime
/// counters: `2024-03-01`, `2024-03-01_general`, `2024-03-01_restricted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub cumulative: u64,
    #[serde(default)]
    pub cumulative_general: u64,
    #[serde(default)]
    pub cumulative_restricted: u64,
    #[serde(rename = "blockedToday", default)]
    pub blocked_today: u32,
    #[serde(rename = "lastBlockDate", default, skip_serializing_if = "Option::is_none")]
    pub last_block_date: Option<NaiveDate>,
    #[serde(rename = "tempAccessCount", default)]
    pub temp_access_count: u32,
    #[serde(flatten)]
    pub days: BTreeMap<String, u64>,
}

impl UsageRecord {
    pub fn add(&mut self, date: NaiveDate, seconds: u64, class: UsageClass) {
        let day = date_to_bucket_key(date);
        *self.days.entry(format!("{day}_{}", class.suffix())).or_default() += seconds;
        *self.days.entry(day).or_default() += seconds;

        self.cumulative += seconds;
        match class {
            UsageClass::General => self.cumulative_general += seconds,
            UsageClass::Restricted => self.cumulative_restricted += seconds,
        }
    }

    pub fn seconds_on(&self, date: NaiveDate) -> u64 {
        self.days
            .get(&date_to_bucket_key(date))
            .copied()
            .unwrap_or_default()
    }

    pub fn seconds_on_as(&self, date: NaiveDate, class: UsageClass) -> u64 {
        self.days
            .get(&format!("{}_{}", date_to_bucket_key(date), class.suffix()))
            .copied()
            .unwrap_or_default()
    }

    /// Drops every day bucket dated before `cutoff`. Lifetime counters are untouched.
    pub fn purge_before(&mut self, cutoff: NaiveDate) -> usize {
        let before = self.days.len();
        self.days
            .retain(|key, _| bucket_key_date(key).map_or(true, |date| date >= cutoff));
        before - self.days.len()
    }

    pub fn blocked_on(&self, today: NaiveDate) -> u32 {
        if self.last_block_date == Some(today) {
            self.blocked_today
        } else {
            0
        }
    }

    pub fn record_block(&mut self, today: NaiveDate) {
        self.blocked_today = self.blocked_on(today) + 1;
        self.last_block_date = Some(today);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedSite {
    pub domain: String,
    pub time_limit_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub domain: String,
    pub reason: BlockReason,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    #[serde(default)]
    pub events: Vec<BlockEvent>,
}

impl BlockStats {
    pub fn purge_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|event| event.timestamp >= cutoff);
        before - self.events.len()
    }
}

/// Set of values that only counts for one calendar day. Inserting on a new day starts over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySet<T: Ord> {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub entries: BTreeSet<T>,
}

impl<T: Ord> Default for DailySet<T> {
    fn default() -> Self {
        Self {
            date: None,
            entries: BTreeSet::new(),
        }
    }
}

impl<T: Ord> DailySet<T> {
    /// Returns false if `value` was already recorded today.
    pub fn insert_for(&mut self, today: NaiveDate, value: T) -> bool {
        if self.date != Some(today) {
            self.entries.clear();
            self.date = Some(today);
        }
        self.entries.insert(value)
    }

    pub fn contains_for(&self, today: NaiveDate, value: &T) -> bool {
        self.date == Some(today) && self.entries.contains(value)
    }

    pub fn clear(&mut self) {
        self.date = None;
        self.entries.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// The single persisted document. Every component reads and writes it whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub usage: BTreeMap<String, UsageRecord>,
    #[serde(default)]
    pub blocked_sites: Vec<String>,
    #[serde(default)]
    pub restricted_sites: Vec<RestrictedSite>,
    #[serde(default)]
    pub block_stats: BlockStats,
    #[serde(default)]
    pub backups: VecDeque<Backup>,
    #[serde(default)]
    pub quota_warnings_sent: DailySet<u8>,
    #[serde(default)]
    pub daily_notifications_sent: DailySet<String>,
}

impl StoreDocument {
    pub fn total_on(&self, date: NaiveDate) -> u64 {
        self.usage.values().map(|record| record.seconds_on(date)).sum()
    }

    /// Appends a snapshot of everything except the backups themselves, evicting the oldest
    /// snapshot beyond [MAX_BACKUPS].
    pub fn push_backup(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut data = serde_json::to_value(&*self)?;
        if let Some(object) = data.as_object_mut() {
            object.remove("backups");
        }
        self.backups.push_back(Backup {
            created_at: now,
            data,
        });
        while self.backups.len() > MAX_BACKUPS {
            self.backups.pop_front();
        }
        Ok(())
    }

    /// Removes day buckets older than `retention_days` and block events older than
    /// `block_retention`. Returns the number of removed buckets and events.
    pub fn purge_history(
        &mut self,
        today: NaiveDate,
        retention_days: u32,
        now: DateTime<Utc>,
        block_retention: Duration,
    ) -> (usize, usize) {
        let cutoff = today - Duration::days(i64::from(retention_days));
        let buckets = self
            .usage
            .values_mut()
            .map(|record| record.purge_before(cutoff))
            .sum();
        let events = self.block_stats.purge_before(now - block_retention);
        (buckets, events)
    }
}
