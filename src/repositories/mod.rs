//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for database
//! entities, with user-scoped access methods.

pub mod download_job;

pub use download_job::{JobStore, JobStoreError, JobUpdate, NewJob};
