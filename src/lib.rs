//! Distributed uptime monitoring pipeline.
//!
//! A [`scheduler`] turns registered targets into check requests, region
//! [`worker`]s probe them and emit ticks, and the batch [`writer`] persists
//! ticks for the read-side [`metrics`] engine. Components only talk through
//! the [`broker`] and the [`store`].

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod store;
pub mod worker;
pub mod writer;
