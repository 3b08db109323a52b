//! # Media Downloads Library
//!
//! Background download jobs that pull scenes, images and playlists from a
//! remote media library onto local storage, plus the HTTP surface that starts,
//! tracks, serves and removes them.

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod file_server;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod remote;
pub mod repositories;
pub mod retry_policy;
pub mod server;
pub mod telemetry;
pub mod worker;
pub use migration;
