use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::debug;

use crate::migrations::Migration;

pub const ADMINS_TABLE: &str = "admins";
pub const LAST_LOGIN_COLUMN: &str = "last_login";
pub const ROLE_SUPER_ADMIN: &str = "super-admin";

/// Adds a nullable `last_login TIMESTAMPTZ` column to `admins`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddLastLoginColumn;

impl Migration for AddLastLoginColumn {
    fn name(&self) -> &str {
        "add_last_login_column"
    }

    fn is_satisfied(&self, tx: &Transaction<'_>) -> rusqlite::Result<bool> {
        column_exists(tx, ADMINS_TABLE, LAST_LOGIN_COLUMN)
    }

    fn apply(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute_batch("ALTER TABLE admins ADD COLUMN last_login TIMESTAMPTZ")
    }
}

/// Gives one admin the `super-admin` role.
///
/// Skipped when the admin already holds the role, and also when no admin has
/// the id: there is nothing to promote, so the run leaves the table untouched.
#[derive(Debug, Clone)]
pub struct PromoteToSuperAdmin {
    admin_id: i64,
    name: String,
}

impl PromoteToSuperAdmin {
    pub fn new(admin_id: i64) -> Self {
        Self {
            admin_id,
            name: format!("promote_admin_{admin_id}_to_super_admin"),
        }
    }
}

impl Migration for PromoteToSuperAdmin {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_satisfied(&self, tx: &Transaction<'_>) -> rusqlite::Result<bool> {
        match admin_role(tx, self.admin_id)? {
            Some(role) => Ok(role.as_deref() == Some(ROLE_SUPER_ADMIN)),
            None => {
                debug!("no admin with id {}, nothing to promote", self.admin_id);
                Ok(true)
            }
        }
    }

    fn apply(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute(
            "UPDATE admins SET role = ?1 WHERE id = ?2",
            params![ROLE_SUPER_ADMIN, self.admin_id],
        )?;
        Ok(())
    }
}

/// A row of `admins` as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRow {
    pub id: i64,
    pub role: Option<String>,
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )
}

/// Role of the admin with `admin_id`: `None` when there is no such row,
/// `Some(None)` when the row exists but its role is NULL.
pub fn admin_role(conn: &Connection, admin_id: i64) -> rusqlite::Result<Option<Option<String>>> {
    conn.query_row(
        "SELECT role FROM admins WHERE id = ?1",
        params![admin_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn list_admins(conn: &Connection) -> rusqlite::Result<Vec<AdminRow>> {
    let mut stmt = conn.prepare("SELECT id, role FROM admins ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(AdminRow {
            id: row.get(0)?,
            role: row.get(1)?,
        })
    })?;
    rows.collect()
}
