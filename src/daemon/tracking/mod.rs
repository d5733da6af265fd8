//! Turns raw browser events into measured intervals: [domain] decides what is trackable,
//! [tracker] owns the sessions.

pub mod domain;
pub mod tracker;
