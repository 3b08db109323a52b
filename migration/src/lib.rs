//! Database migrations for the media downloads service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_03_02_090000_create_download_jobs;
mod m2026_03_02_090100_add_download_job_active_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_03_02_090000_create_download_jobs::Migration),
            Box::new(m2026_03_02_090100_add_download_job_active_guard::Migration),
        ]
    }
}
