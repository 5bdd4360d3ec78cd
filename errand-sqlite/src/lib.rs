#![doc = include_str!("../README.md")]

pub mod queue;
mod types;

pub use queue::SqliteQueue;
use sqlx::migrate::Migrator;
pub static MIGRATOR: Migrator = sqlx::migrate!();
