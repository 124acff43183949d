//! Concrete migrations shipped with backops.

pub mod admins;
pub mod sql;

pub use admins::{ADMINS_TABLE, AddLastLoginColumn, AdminRow, PromoteToSuperAdmin, ROLE_SUPER_ADMIN};
pub use sql::SqlMigration;
