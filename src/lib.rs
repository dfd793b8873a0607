//! Sessiongate - a session registry and validating reverse proxy
//!
//! This library provides a gateway in front of short-lived per-session
//! backend processes that:
//! - Provisions and tears down backends through external setup/cleanup commands
//! - Persists the correlation id to port mapping in SQLite
//! - Validates proxied requests against each backend's published API spec
//! - Forwards accepted requests over pooled loopback connections
//! - Discovers, health-checks and terminates backend OS processes

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod pool;
pub mod provision;
pub mod proxy;
pub mod ratelimit;
pub mod spec_cache;
pub mod supervisor;
pub mod validator;
