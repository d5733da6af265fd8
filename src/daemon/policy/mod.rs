//! Access policy: persisted per-domain rules and the volatile grants that override them.

pub mod grants;
pub mod redirect;
pub mod rules;
