//! Anti-abuse filters for a mail transfer agent: auto-whitelisting,
//! greylisting, sender dialback and a simple retry check, all built on a
//! TTL-keyed store with pluggable backends.

pub mod config;
pub mod dialback;
pub mod filters;
pub mod fingerprint;
pub mod storage;

pub use filters::{open_filters, run_chain, Decision, Filter, MessageContext};
pub use storage::{Store, StoreError};
