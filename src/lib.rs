//! Stashpoint: an offline-first caching agent.
//!
//! The [`cache`] module holds the versioned response cache and the
//! serve-or-fetch policy, [`agent`] maps lifecycle events onto it, and
//! [`infra`] provides the network fetcher, the interception proxy and
//! telemetry bootstrap.

pub mod agent;
pub mod cache;
pub mod config;
pub mod infra;
