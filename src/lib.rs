//! Client-side data consistency for church administration dashboards: a
//! two-tier TTL cache and an offline-first write queue.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod store;
pub mod sync;
