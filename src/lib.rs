//! Data-access optimization layer in front of Postgres.
//!
//! Reads go through a TTL-tiered Redis cache with cached pagination, writes
//! and change-feed events invalidate the affected keys, and row changes fan
//! out to WebSocket clients through the realtime registry.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod realtime;
