use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::daemon::{
    error::ValidationError,
    storage::{
        document_store::DocumentStore,
        entities::{RestrictedSite, StoreDocument},
    },
    tracking::domain::{extract_domain, normalize_domain_input},
};

use super::grants::GrantManager;

const MAX_TIME_LIMIT_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Rule {
    Blocked {
        domain: String,
    },
    #[serde(rename_all = "camelCase")]
    Restricted {
        domain: String,
        time_limit_minutes: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Blocked,
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockReason {
    Blocked,
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub should_block: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
}

impl AccessDecision {
    pub const ALLOW: AccessDecision = AccessDecision {
        should_block: false,
        reason: None,
    };
}

impl Rule {
    /// Builds a rule from request fields, normalising the domain.
    pub fn parse(
        domain: &str,
        kind: RuleKind,
        time_limit_minutes: Option<u32>,
    ) -> Result<Rule, ValidationError> {
        let domain = normalize_domain_input(domain)?;
        match kind {
            RuleKind::Blocked => Ok(Rule::Blocked { domain }),
            RuleKind::Restricted => {
                let minutes = time_limit_minutes.ok_or_else(|| {
                    ValidationError::invalid("timeLimitMinutes", "required for restricted sites")
                })?;
                if !(1..=MAX_TIME_LIMIT_MINUTES).contains(&minutes) {
                    return Err(ValidationError::invalid(
                        "timeLimitMinutes",
                        format!("must be 1-{MAX_TIME_LIMIT_MINUTES}"),
                    ));
                }
                Ok(Rule::Restricted {
                    domain,
                    time_limit_minutes: minutes,
                })
            }
        }
    }

    pub fn domain(&self) -> &str {
        match self {
            Rule::Blocked { domain } | Rule::Restricted { domain, .. } => domain,
        }
    }

    /// Decision for this rule alone, ignoring grants.
    pub fn evaluate(&self, today_time_seconds: u64) -> AccessDecision {
        match self {
            Rule::Blocked { .. } => AccessDecision {
                should_block: true,
                reason: Some(BlockReason::Blocked),
            },
            Rule::Restricted {
                time_limit_minutes, ..
            } => AccessDecision {
                should_block: today_time_seconds >= u64::from(*time_limit_minutes) * 60,
                reason: Some(BlockReason::Restricted),
            },
        }
    }
}

/// Listing in the persisted shape: bare domains for blocked sites, domain and limit for
/// restricted ones. Both lists are sorted by domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleListing {
    pub blocked: Vec<String>,
    pub restricted: Vec<RestrictedSite>,
}

/// One policy per domain. All rule writes go through here so the stored lists and the
/// in-memory map never diverge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleEngine {
    rules: HashMap<String, Rule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the rule set from the stored lists. A domain present in both lists ends up
    /// restricted.
    pub fn from_document(document: &StoreDocument) -> Self {
        let mut engine = Self::new();
        for domain in &document.blocked_sites {
            engine.insert(Rule::Blocked {
                domain: domain.clone(),
            });
        }
        for site in &document.restricted_sites {
            engine.insert(Rule::Restricted {
                domain: site.domain.clone(),
                time_limit_minutes: site.time_limit_minutes,
            });
        }
        engine
    }

    pub fn listing(&self) -> RuleListing {
        let mut listing = RuleListing::default();
        for rule in self.rules.values() {
            match rule {
                Rule::Blocked { domain } => listing.blocked.push(domain.clone()),
                Rule::Restricted {
                    domain,
                    time_limit_minutes,
                } => listing.restricted.push(RestrictedSite {
                    domain: domain.clone(),
                    time_limit_minutes: *time_limit_minutes,
                }),
            }
        }
        listing.blocked.sort();
        listing.restricted.sort_by(|a, b| a.domain.cmp(&b.domain));
        listing
    }

    pub fn write_to(&self, document: &mut StoreDocument) {
        let RuleListing {
            blocked,
            restricted,
        } = self.listing();
        document.blocked_sites = blocked;
        document.restricted_sites = restricted;
    }

    fn insert(&mut self, rule: Rule) -> Option<Rule> {
        self.rules.insert(rule.domain().to_owned(), rule)
    }

    pub fn get_rule(&self, domain: &str) -> Option<&Rule> {
        self.rules.get(domain)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Adds or replaces the rule for its domain. The in-memory set only changes once the store
    /// accepted the write.
    pub async fn add_rule<S: DocumentStore + ?Sized>(&mut self, rule: Rule, store: &S) -> Result<()> {
        let mut candidate = self.clone();
        let replaced = candidate.insert(rule.clone());
        candidate.persist(store).await?;
        *self = candidate;
        match replaced {
            Some(previous) => info!("Replaced rule {previous:?} with {rule:?}"),
            None => info!("Added rule {rule:?}"),
        }
        Ok(())
    }

    /// Returns whether a rule existed.
    pub async fn remove_rule<S: DocumentStore + ?Sized>(
        &mut self,
        domain: &str,
        store: &S,
    ) -> Result<bool> {
        if !self.rules.contains_key(domain) {
            return Ok(false);
        }
        let mut candidate = self.clone();
        candidate.rules.remove(domain);
        candidate.persist(store).await?;
        *self = candidate;
        info!("Removed rule for {domain}");
        Ok(true)
    }

    async fn persist<S: DocumentStore + ?Sized>(&self, store: &S) -> Result<()> {
        let mut document = store.load().await?;
        self.write_to(&mut document);
        store.save(&document).await
    }

    /// Access decision for `url` given today's recorded seconds on its domain. A live grant
    /// always wins over the rule.
    pub fn evaluate_access(
        &self,
        url: &str,
        today_time_seconds: u64,
        grants: &GrantManager,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let Some(domain) = extract_domain(url) else {
            return AccessDecision::ALLOW;
        };
        let Some(rule) = self.rules.get(&domain) else {
            return AccessDecision::ALLOW;
        };
        if grants.is_live(&domain, now) {
            return AccessDecision::ALLOW;
        }
        rule.evaluate(today_time_seconds)
    }
}
