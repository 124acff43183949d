pub mod definitions;
pub mod migrations;
pub mod pool;

pub use definitions::{AddLastLoginColumn, PromoteToSuperAdmin, SqlMigration};
pub use migrations::{
    Migration, MigrationError, MigrationFailure, MigrationOutcome, MigrationRunner, Stage,
};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolStatus, PooledConnection};
