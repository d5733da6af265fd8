//! Maps URLs onto the domain key used by tracking and rules.

use std::collections::HashSet;

use url::Url;

use crate::daemon::error::ValidationError;

/// Hosts that are never tracked regardless of configuration.
const BUILTIN_EXCLUSIONS: [&str; 4] = ["localhost", "127.0.0.1", "0.0.0.0", "[::1]"];
const TRACKED_SCHEMES: [&str; 2] = ["http", "https"];
const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Returns the lower-cased hostname of `url` with a leading `www.` removed.
///
/// Inputs the URL parser rejects (missing scheme, stray characters) go through a lenient
/// scan that cuts the authority out by hand.
pub fn extract_domain(url: &str) -> Option<String> {
    let host = match Url::parse(url.trim()) {
        Ok(parsed) => parsed.host_str().map(str::to_lowercase),
        Err(_) => scan_host(url),
    }?;
    let host = host.strip_prefix("www.").unwrap_or(&host);
    (!host.is_empty()).then(|| host.to_owned())
}

fn scan_host(url: &str) -> Option<String> {
    let rest = url.trim();
    let rest = rest.split_once("://").map_or(rest, |(_, after)| after);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = if host_port.starts_with('[') {
        host_port.split_inclusive(']').next()?
    } else {
        host_port.split(':').next()?
    };
    let host = host.trim().to_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Hostname syntax check: dot-separated labels of ASCII alphanumerics and inner hyphens, at
/// least two labels.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }
    let labels = domain.split('.').collect::<Vec<_>>();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Normalises user input for a rule or grant. Accepts a bare domain or a full URL.
pub fn normalize_domain_input(input: &str) -> Result<String, ValidationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ValidationError::invalid("domain", "cannot be empty"));
    }
    let candidate = if input.contains("://") {
        extract_domain(input)
    } else {
        extract_domain(&format!("https://{input}"))
    };

    match candidate {
        Some(domain) if is_valid_domain(&domain) => Ok(domain),
        _ => Err(ValidationError::invalid(
            "domain",
            format!("'{input}' is not a valid domain"),
        )),
    }
}

/// Decides which URLs accrue time.
#[derive(Debug, Clone)]
pub struct DomainClassifier {
    excluded: HashSet<String>,
}

impl Default for DomainClassifier {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl DomainClassifier {
    pub fn new(extra_exclusions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let excluded = BUILTIN_EXCLUSIONS
            .into_iter()
            .map(String::from)
            .chain(extra_exclusions.into_iter().map(Into::into))
            .collect();
        Self { excluded }
    }

    /// Trackable domain of `url`, or `None` for browser-internal pages, excluded hosts and
    /// malformed URLs.
    pub fn trackable_domain(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url.trim()).ok()?;
        if !TRACKED_SCHEMES.contains(&parsed.scheme()) {
            return None;
        }
        let domain = extract_domain(url)?;
        if self.excluded.contains(&domain) || !is_valid_domain(&domain) {
            return None;
        }
        Some(domain)
    }

    pub fn should_track(&self, url: &str) -> bool {
        self.trackable_domain(url).is_some()
    }
}
