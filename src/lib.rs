//! Warden - Proxy Health & Assignment Engine
//!
//! Keeps a fleet of forward proxies honest and hands them out to identities.
//!
//! ## Features
//!
//! - Periodic, bounded-concurrency health sweeps over HTTP and SOCKS5 proxies
//! - Consecutive-failure tracking with automatic quarantine and recovery
//! - Quarantine alerts with pluggable notifiers
//! - Proxy assignment by strategy (auto, least-used, fastest, round-robin, manual)
//! - PostgreSQL registry with Redis or in-process shared state

pub mod assignment;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod models;
pub mod repository;
pub mod store;

pub use assignment::AssignmentSelector;
pub use config::Config;
pub use database::Database;
pub use error::{Result, WardenError};
pub use health::{HealthScheduler, SchedulerHandle};
