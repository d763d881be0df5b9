//! # Issue Mirror Library
//!
//! Replicates GitLab issues, with their comments, attachments, labels and
//! time tracking, from the source project of a repository mirror to its target
//! project. Includes the scheduler, the manual trigger API and the persistence
//! that makes runs resumable.

pub mod config;
pub mod db;
pub mod error;
pub mod gitlab;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod resilience;
pub mod scheduler;
pub mod server;
pub mod sync;
pub mod telemetry;
pub use migration;
