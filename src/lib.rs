//! Rate-governed mirror of the official game-data API.
//!
//! Outbound requests go through a [`dispatch::Dispatcher`] that holds one
//! [`dispatch::TokenBucket`]; bulk lookups are split into chunks by
//! [`query`]; results are cached in JSON-backed [`store::Store`]s reachable
//! through a [`store::Registry`].

pub mod api;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod model;
pub mod query;
pub mod store;
pub mod sync;
