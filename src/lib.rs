//! Timezone-aware time tracking engine.
//!
//! Entries are stored in day partitions keyed by the civil date their start
//! had in the timezone selected when they were recorded. Everything else
//! (daily totals, breaks, weekly rows, invoices) is derived from those
//! partitions on read.

pub mod config;
pub mod daily;
pub mod domain;
pub mod error;
pub mod interval_store;
pub mod reconcile;
pub mod store;
pub mod timer;
pub mod timezone;
pub mod transfer;
pub mod weekly;
