//! OpsPro Engine Library
//!
//! Onboarding verification, deployment and live-log streaming for hosts
//! managed by the OpsPro dashboard, all driven over SSH.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod jobs;
pub mod logs;
pub mod probe;
pub mod relay;
pub mod server;
pub mod ssh;
pub mod storage;
pub mod utils;
pub mod vault;
