//! Postgres connection pool and migrations.

pub mod pool;

pub use pool::{connect_and_migrate, create_pool, run_migrations, DatabaseError};
