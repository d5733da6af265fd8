use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Grant {
    expires_at: DateTime<Utc>,
    /// Distinguishes successive grants for the same domain so that a cleanup scheduled for an
    /// older grant cannot remove a newer one.
    generation: u64,
}

/// Handle returned by [GrantManager::grant], passed back to [GrantManager::expire] when the
/// cleanup timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantTicket {
    pub generation: u64,
    pub expires_at: DateTime<Utc>,
}

/// Memory-only, time-boxed overrides of rule decisions. Lost on restart.
#[derive(Debug, Default)]
pub struct GrantManager {
    grants: HashMap<String, Grant>,
    next_generation: u64,
}

impl GrantManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or overwrites the grant for `domain`.
    pub fn grant(&mut self, domain: &str, duration: Duration, now: DateTime<Utc>) -> GrantTicket {
        self.next_generation += 1;
        let grant = Grant {
            expires_at: now + duration,
            generation: self.next_generation,
        };
        self.grants.insert(domain.to_owned(), grant);
        debug!("Granted {domain} access until {}", grant.expires_at);
        GrantTicket {
            generation: grant.generation,
            expires_at: grant.expires_at,
        }
    }

    /// True while a grant is live. Expired entries found here are dropped.
    pub fn has_access(&mut self, domain: &str, now: DateTime<Utc>) -> bool {
        match self.grants.get(domain) {
            Some(grant) if now < grant.expires_at => true,
            Some(_) => {
                self.grants.remove(domain);
                false
            }
            None => false,
        }
    }

    /// Read-only liveness check used during policy evaluation.
    pub fn is_live(&self, domain: &str, now: DateTime<Utc>) -> bool {
        self.grants
            .get(domain)
            .is_some_and(|grant| now < grant.expires_at)
    }

    /// Milliseconds left on the grant, 0 when there is none.
    pub fn remaining_ms(&mut self, domain: &str, now: DateTime<Utc>) -> u64 {
        if !self.has_access(domain, now) {
            return 0;
        }
        self.grants
            .get(domain)
            .map(|grant| (grant.expires_at - now).num_milliseconds())
            .and_then(|ms| u64::try_from(ms).ok())
            .unwrap_or(0)
    }

    pub fn revoke(&mut self, domain: &str) -> bool {
        self.grants.remove(domain).is_some()
    }

    /// Cleanup callback. Only removes the grant the ticket was issued for, and only once it has
    /// actually expired; revoked or re-granted entries are left alone.
    pub fn expire(&mut self, domain: &str, ticket: GrantTicket, now: DateTime<Utc>) -> bool {
        match self.grants.get(domain) {
            Some(grant) if grant.generation == ticket.generation && now >= grant.expires_at => {
                self.grants.remove(domain);
                debug!("Grant for {domain} expired");
                true
            }
            _ => false,
        }
    }
}
