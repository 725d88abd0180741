//! Fleetgate - a gateway in front of a fleet of app runners
//!
//! This library provides a cluster-aware reverse proxy that:
//! - Keeps a persisted registry of runners, each with a fixed app capacity
//! - Places new apps on the first runner with a free slot
//! - Routes `/{app}/...` traffic to the runner hosting that app
//! - Rebuilds its routing table by asking every runner what it hosts
//! - Rewrites backend redirects so runners stay invisible to clients

pub mod allocator;
pub mod capture;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod management;
pub mod pool;
pub mod proxy;
pub mod reconcile;
pub mod routes;
