//!  Storage is organized through [document_store::JsonDocumentStore].
//!  The basic idea is:
//!   - All state lives in one JSON document (`store.json`) in the application directory.
//!   - Components load the whole document, change their part, and save it back.
//!   - Usage is kept per domain as lifetime counters plus per-local-day buckets.

pub mod document_store;
pub mod entities;
