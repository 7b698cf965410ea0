//! enroll-daemon - Device Onboarding Service daemon library
//!
//! The daemon is the thin outer shell around [`enroll_core`]: it validates
//! inbound HTTP requests, hands them to the onboarding orchestrator, and
//! maps the orchestrator's error taxonomy onto HTTP status codes. The core
//! library is synchronous; handlers bridge into it with
//! `tokio::task::spawn_blocking` so a running saga is never cancelled by a
//! client disconnect — it always reaches a terminal state.
//!
//! # Modules
//!
//! - [`config`]: TOML daemon configuration
//! - [`state`]: shared daemon state handle
//! - [`handlers`]: HTTP routes and error mapping
//! - [`metrics`]: Prometheus metrics for onboarding observability

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod state;

pub use config::DaemonConfig;
pub use state::{AppState, SharedState};
