use url::Url;

use super::rules::BlockReason;

/// Target of the redirect issued for a blocked navigation: the extension's block page with the
/// domain, the original URL and the reason in the query.
pub fn blocked_page_url(
    base: &str,
    domain: &str,
    original_url: &str,
    reason: BlockReason,
) -> Result<String, url::ParseError> {
    let mut target = Url::parse(base)?;
    let reason = match reason {
        BlockReason::Blocked => "blocked",
        BlockReason::Restricted => "restricted",
    };
    target
        .query_pairs_mut()
        .append_pair("domain", domain)
        .append_pair("url", original_url)
        .append_pair("reason", reason);
    Ok(target.into())
}
