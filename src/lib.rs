//! Concurrent bandwidth and latency probing against speedtest.net servers and
//! fast.com CDN targets.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod geo;
pub mod latency;
pub mod prober;
pub mod report;
pub mod sources;
pub mod traits;
pub mod types;

#[cfg(test)]
mod testing;
