//! Database schema, applied through sqlx migrations.

use sqlx::migrate::Migrator;

/// Migrations for the event, command, snapshot and watermark tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
