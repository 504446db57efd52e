//! Notification dispatch service.
//!
//! Accepts notification requests over HTTP, optionally renders the message
//! from a template, records every notification, and delivers it through
//! email, webhook, Slack or file channels, either synchronously or through
//! a persistent job queue drained by a worker pool.

// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Domain
pub mod channels;
pub mod notification;
pub mod queue;
pub mod ratelimit;
pub mod store;
pub mod template;

// Application layer
pub mod api;
pub mod server;
pub mod shutdown;
