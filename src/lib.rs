//! Webhook ingestion service: verify and log source-control events, render
//! per-repository instruction templates, and hand the results to an agent.

pub mod agent;
pub mod config;
pub mod error;
pub mod http_server;
pub mod pipeline;
pub mod render;
pub mod store;
pub mod templates;
pub mod types;
pub mod verification;
