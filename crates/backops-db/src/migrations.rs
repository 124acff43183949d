//! Single-step, idempotent migrations applied under one transaction.
//!
//! A [`Migration`] pairs a read-only precondition with an apply action. The
//! [`MigrationRunner`] checks out one connection, opens an `IMMEDIATE`
//! transaction, and only runs the apply action when the precondition says the
//! target state does not hold yet. Anything that goes wrong after the
//! transaction is open is rolled back before the outcome is returned.

use std::fmt;
use std::time::{Duration, Instant};

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pool::{ConnectionPool, PoolError};

/// A named change that is applied at most once.
pub trait Migration {
    fn name(&self) -> &str;

    /// Returns `true` when the target state already holds and `apply` must be skipped.
    fn is_satisfied(&self, tx: &Transaction<'_>) -> rusqlite::Result<bool>;

    fn apply(&self, tx: &Transaction<'_>) -> rusqlite::Result<()>;
}

/// Where in the run a failure or timeout happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquire,
    Begin,
    Precondition,
    Apply,
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Acquire => "acquire",
            Self::Begin => "begin",
            Self::Precondition => "precondition",
            Self::Apply => "apply",
            Self::Commit => "commit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("connection error: {0}")]
    Connection(#[source] PoolError),

    #[error("failed to begin transaction: {0}")]
    TransactionStart(#[source] rusqlite::Error),

    #[error("precondition check failed: {0}")]
    PreconditionCheck(#[source] rusqlite::Error),

    #[error("apply failed: {0}")]
    Apply(#[source] rusqlite::Error),

    #[error("commit failed: {0}")]
    Commit(#[source] rusqlite::Error),

    #[error("deadline exceeded during {stage}")]
    Timeout { stage: Stage },
}

impl MigrationError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Connection(_) => Stage::Acquire,
            Self::TransactionStart(_) => Stage::Begin,
            Self::PreconditionCheck(_) => Stage::Precondition,
            Self::Apply(_) => Stage::Apply,
            Self::Commit(_) => Stage::Commit,
            Self::Timeout { stage } => *stage,
        }
    }
}

impl From<PoolError> for MigrationError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout => Self::Timeout {
                stage: Stage::Acquire,
            },
            other => Self::Connection(other),
        }
    }
}

/// The cause of a failed run, plus the rollback error if cleanup failed too.
#[derive(Debug)]
pub struct MigrationFailure {
    pub cause: MigrationError,
    pub rollback: Option<rusqlite::Error>,
}

impl MigrationFailure {
    fn new(cause: MigrationError) -> Self {
        Self {
            cause,
            rollback: None,
        }
    }
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if let Some(rollback) = &self.rollback {
            write!(f, " (rollback also failed: {rollback})")?;
        }
        Ok(())
    }
}

impl std::error::Error for MigrationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

#[derive(Debug)]
pub enum MigrationOutcome {
    /// The change was made and committed.
    Applied,
    /// The precondition reported the change already holds.
    Skipped,
    /// Nothing was persisted.
    Failed(MigrationFailure),
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn failure(&self) -> Option<&MigrationFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(failure) => write!(f, "failed: {failure}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Runs migrations against connections from a shared pool.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    pool: ConnectionPool,
}

impl MigrationRunner {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn run(&self, migration: &dyn Migration) -> MigrationOutcome {
        self.execute(migration, None)
    }

    /// Run with a deadline. The deadline bounds the wait for a connection and
    /// is checked between steps; an overrun rolls back and reports `Timeout`.
    ///
    /// For the length of the run the connection's busy timeout is clamped to the
    /// time left, so waiting for the write lock in `BEGIN IMMEDIATE` also ends
    /// at the deadline. A statement that is already executing is not interrupted.
    pub fn run_until(&self, migration: &dyn Migration, deadline: Instant) -> MigrationOutcome {
        self.execute(migration, Some(deadline))
    }

    fn execute(&self, migration: &dyn Migration, deadline: Option<Instant>) -> MigrationOutcome {
        let name = migration.name();
        debug!("running migration {name}");

        let checkout = match deadline {
            Some(deadline) => self.pool.acquire_until(deadline),
            None => self.pool.acquire(),
        };

        let busy_timeout = self.pool.config().busy_timeout;
        let result = match checkout {
            Ok(mut conn) => {
                let result = transact(&mut conn, migration, deadline, busy_timeout);
                if deadline.is_some() {
                    if let Err(e) = conn.busy_timeout(busy_timeout) {
                        warn!("failed to restore busy timeout after {name}: {e}");
                    }
                }
                result
            }
            Err(e) => Err(MigrationFailure::new(e.into())),
        };

        let outcome = match result {
            Ok(true) => MigrationOutcome::Applied,
            Ok(false) => MigrationOutcome::Skipped,
            Err(failure) => MigrationOutcome::Failed(failure),
        };

        match &outcome {
            MigrationOutcome::Failed(failure) => {
                error!("migration {name} failed at {}: {failure}", failure.cause.stage());
            }
            other => info!("migration {name} {}", other.label()),
        }
        outcome
    }
}

/// Returns `Ok(true)` when the change was applied, `Ok(false)` when skipped.
fn transact(
    conn: &mut Connection,
    migration: &dyn Migration,
    deadline: Option<Instant>,
    busy_timeout: Duration,
) -> Result<bool, MigrationFailure> {
    check_deadline(deadline, Stage::Begin).map_err(MigrationFailure::new)?;

    let mut clamped = false;
    if let Some(deadline) = deadline {
        let left = deadline.saturating_duration_since(Instant::now());
        if left < busy_timeout {
            conn.busy_timeout(left)
                .map_err(|e| MigrationFailure::new(MigrationError::TransactionStart(e)))?;
            clamped = true;
        }
    }

    let tx = Transaction::new(conn, TransactionBehavior::Immediate)
        .map_err(|e| MigrationFailure::new(begin_error(e, clamped)))?;
    debug!("transaction open for {}", migration.name());

    match evaluate(&tx, migration, deadline) {
        Ok(applied) => {
            tx.commit()
                .map_err(|e| MigrationFailure::new(MigrationError::Commit(e)))?;
            Ok(applied)
        }
        Err(cause) => {
            warn!("rolling back {}: {cause}", migration.name());
            let rollback = tx.rollback().err();
            if let Some(e) = &rollback {
                error!("rollback of {} failed: {e}", migration.name());
            }
            Err(MigrationFailure { cause, rollback })
        }
    }
}

/// A busy failure while the busy timeout was cut short by the deadline is a timeout.
fn begin_error(err: rusqlite::Error, clamped: bool) -> MigrationError {
    let busy = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DatabaseBusy
    );
    if clamped && busy {
        MigrationError::Timeout {
            stage: Stage::Begin,
        }
    } else {
        MigrationError::TransactionStart(err)
    }
}

fn evaluate(
    tx: &Transaction<'_>,
    migration: &dyn Migration,
    deadline: Option<Instant>,
) -> Result<bool, MigrationError> {
    check_deadline(deadline, Stage::Precondition)?;
    let satisfied = migration
        .is_satisfied(tx)
        .map_err(MigrationError::PreconditionCheck)?;

    if satisfied {
        debug!("precondition holds for {}, nothing to apply", migration.name());
        check_deadline(deadline, Stage::Commit)?;
        return Ok(false);
    }

    check_deadline(deadline, Stage::Apply)?;
    migration.apply(tx).map_err(MigrationError::Apply)?;
    check_deadline(deadline, Stage::Commit)?;
    Ok(true)
}

fn check_deadline(deadline: Option<Instant>, stage: Stage) -> Result<(), MigrationError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(MigrationError::Timeout { stage }),
        _ => Ok(()),
    }
}
