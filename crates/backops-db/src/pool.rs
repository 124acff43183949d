use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::{Duration, Instant};

use r2d2::{HandleError, ManageConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors surfaced while obtaining a connection from the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted: all {max_connections} connections in use after {waited:?}")]
    Exhausted {
        max_connections: u32,
        waited: Duration,
    },

    #[error("deadline elapsed while waiting for a connection")]
    Timeout,

    #[error("failed to open connection: {0}")]
    Connect(String),

    #[error("invalid pool configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on connections open at the same time.
    pub max_connections: u32,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout: Duration,
    /// SQLite busy handler timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_connections: u32,
    pub open: u32,
    pub idle: u32,
    pub in_use: u32,
}

/// `SqliteConnectionManager` that refuses to recycle a connection still
/// inside a transaction.
struct SqliteManager(SqliteConnectionManager);

impl ManageConnection for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        self.0.connect()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        self.0.is_valid(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        !conn.is_autocommit()
    }
}

#[derive(Debug)]
struct TracingErrorHandler;

impl HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        warn!("failed to open pooled connection: {error}");
    }
}

/// Bounded pool of SQLite connections backed by r2d2.
///
/// Cloning is cheap and every clone hands out connections from the same pool.
/// Connections are opened lazily, up to `max_connections`, and are returned
/// when the [`PooledConnection`] guard is dropped.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: Pool<SqliteManager>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Pool of connections to the existing database file at `db_path`.
    pub fn open(db_path: &Path, config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_init(db_path, config, |_| Ok(()))
    }

    /// Like [`open`](Self::open), running `init` on every new connection after
    /// the standard pragmas.
    pub fn with_init<F>(db_path: &Path, config: PoolConfig, init: F) -> Result<Self, PoolError>
    where
        F: Fn(&mut Connection) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        if config.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if config.acquire_timeout.is_zero() {
            return Err(PoolError::Config(
                "acquire_timeout must be greater than zero".into(),
            ));
        }
        // The file is never created here; a typo must not leave an empty database behind.
        if !db_path.exists() {
            return Err(PoolError::Connect(format!(
                "database file {} does not exist",
                db_path.display()
            )));
        }

        info!(
            "opening connection pool at {} (max {} connections)",
            db_path.display(),
            config.max_connections
        );

        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_init(move |conn| {
                // Set before the pragmas: switching to WAL takes a lock other openers may hold.
                conn.busy_timeout(busy_timeout)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                init(conn)
            });

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(0))
            .connection_timeout(config.acquire_timeout)
            .error_handler(Box::new(TracingErrorHandler))
            .build_unchecked(SqliteManager(manager));

        Ok(Self { pool, config })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take a connection, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        self.checkout(None)
    }

    /// Like [`acquire`](Self::acquire), but gives up at `deadline` if that
    /// comes before the configured timeout.
    pub fn acquire_until(&self, deadline: Instant) -> Result<PooledConnection, PoolError> {
        self.checkout(Some(deadline))
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            max_connections: self.config.max_connections,
            open: state.connections,
            idle: state.idle_connections,
            in_use: state.connections - state.idle_connections,
        }
    }

    fn checkout(&self, deadline: Option<Instant>) -> Result<PooledConnection, PoolError> {
        let acquire_timeout = self.config.acquire_timeout;
        let (wait, caller_bound) = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left < acquire_timeout {
                    (left, true)
                } else {
                    (acquire_timeout, false)
                }
            }
            None => (acquire_timeout, false),
        };

        let started = Instant::now();
        match self.pool.get_timeout(wait) {
            Ok(conn) => Ok(PooledConnection { conn }),
            Err(e) => {
                let state = self.pool.state();
                if caller_bound {
                    Err(PoolError::Timeout)
                } else if state.connections < self.config.max_connections {
                    // Capacity was free, so the wait ended on a failed open.
                    Err(PoolError::Connect(e.to_string()))
                } else {
                    Err(PoolError::Exhausted {
                        max_connections: self.config.max_connections,
                        waited: started.elapsed(),
                    })
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Exclusive handle to a pooled connection. Returned to the pool on drop.
#[derive(Debug)]
pub struct PooledConnection {
    conn: r2d2::PooledConnection<SqliteManager>,
}

impl PooledConnection {
    /// Return the connection to the pool now rather than at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    // A connection left inside a transaction is discarded by the pool on return.
    fn drop(&mut self) {
        if self.conn.is_autocommit() {
            return;
        }
        warn!("connection released with an open transaction, rolling back");
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            error!("rollback on release failed, discarding connection: {e}");
        }
    }
}
