//! Native messaging host for a browser extension. Attributes foreground browsing time to
//! domains, keeps daily usage history, and enforces per-site blocks and daily time limits with
//! short-lived manual overrides.
//!

pub mod browser_api;
pub mod daemon;
pub mod fs;
pub mod utils;
