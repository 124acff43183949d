use rusqlite::types::Value;
use rusqlite::{Transaction, params_from_iter};

use crate::migrations::Migration;

/// A migration written as plain SQL.
///
/// `check` must return a single row whose first column is non-zero when the
/// target state already holds. Each entry in `statements` is one SQL
/// statement; statements run in order. Positional parameters are bound to the
/// check and to every statement, each taking as many as it declares.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    name: String,
    check: String,
    statements: Vec<String>,
    params: Vec<Value>,
}

impl SqlMigration {
    pub fn new(name: impl Into<String>, check: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            check: check.into(),
            statements: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }

    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    fn bound(&self, count: usize) -> impl Iterator<Item = &Value> {
        self.params.iter().take(count)
    }
}

impl Migration for SqlMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_satisfied(&self, tx: &Transaction<'_>) -> rusqlite::Result<bool> {
        let mut stmt = tx.prepare(&self.check)?;
        let count = stmt.parameter_count();
        let flag: i64 = stmt.query_row(params_from_iter(self.bound(count)), |row| row.get(0))?;
        Ok(flag != 0)
    }

    fn apply(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        for sql in &self.statements {
            let mut stmt = tx.prepare(sql)?;
            let count = stmt.parameter_count();
            stmt.execute(params_from_iter(self.bound(count)))?;
        }
        Ok(())
    }
}
