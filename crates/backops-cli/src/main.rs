mod logging;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use backops_config::{AppConfig, ConfigLoader};
use backops_db::definitions::ADMINS_TABLE;
use backops_db::definitions::admins::{LAST_LOGIN_COLUMN, column_exists, list_admins};
use backops_db::{
    AddLastLoginColumn, ConnectionPool, Migration, MigrationOutcome, MigrationRunner, PoolConfig,
    PromoteToSuperAdmin,
};
use clap::{Parser, Subcommand};
use tracing::debug;

#[derive(Parser)]
#[command(name = "backops")]
#[command(version, about = "Idempotent maintenance tasks for the admin database")]
struct Cli {
    /// YAML or TOML config file
    #[arg(long, short, env = "BACKOPS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides config and BACKOPS_DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Fail with a timeout if the task has not finished after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add the nullable last_login column to admins if it is missing
    AddLastLogin,

    /// Give an admin the super-admin role
    PromoteAdmin {
        /// Id of the admin row to promote
        #[arg(long, env = "BACKOPS_ADMIN_ID")]
        id: i64,
    },

    /// Show the admins schema and roles without changing anything
    Status,
}

fn main() -> ExitCode {
    // A missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config =
        ConfigLoader::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    logging::init(&config.log);
    debug!("database config: {:?}", config.database);

    let pool = ConnectionPool::open(&config.database.path, pool_config(&config))
        .context("failed to set up connection pool")?;
    let deadline = cli
        .timeout_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    match cli.command {
        Commands::AddLastLogin => Ok(exit_code(execute(&pool, &AddLastLoginColumn, deadline))),
        Commands::PromoteAdmin { id } => Ok(exit_code(execute(
            &pool,
            &PromoteToSuperAdmin::new(id),
            deadline,
        ))),
        Commands::Status => {
            print_status(&pool, &config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn pool_config(config: &AppConfig) -> PoolConfig {
    PoolConfig {
        max_connections: config.database.max_connections,
        acquire_timeout: config.database.acquire_timeout(),
        busy_timeout: config.database.busy_timeout(),
    }
}

fn execute(
    pool: &ConnectionPool,
    migration: &dyn Migration,
    deadline: Option<Instant>,
) -> MigrationOutcome {
    let runner = MigrationRunner::new(pool.clone());
    let outcome = match deadline {
        Some(deadline) => runner.run_until(migration, deadline),
        None => runner.run(migration),
    };

    println!("{}", report::outcome_line(migration.name(), &outcome));
    outcome
}

/// Applied and skipped both count as success; setup errors exit with 2 in `main`.
fn exit_status(outcome: &MigrationOutcome) -> u8 {
    if outcome.is_success() { 0 } else { 1 }
}

fn exit_code(outcome: MigrationOutcome) -> ExitCode {
    ExitCode::from(exit_status(&outcome))
}

fn print_status(pool: &ConnectionPool, config: &AppConfig) -> Result<()> {
    let conn = pool.acquire().context("failed to acquire connection")?;
    let has_last_login = column_exists(&conn, ADMINS_TABLE, LAST_LOGIN_COLUMN)
        .context("failed to inspect admins schema")?;
    let admins = list_admins(&conn).context("failed to read admins")?;
    conn.release();

    for line in report::status_lines(&config.database.path, has_last_login, &admins) {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn promote_admin_parses_id() {
        let cli = Cli::try_parse_from(["backops", "promote-admin", "--id", "1"]).unwrap();
        assert!(matches!(cli.command, Commands::PromoteAdmin { id: 1 }));
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "backops",
            "add-last-login",
            "--database",
            "/tmp/admins.db",
            "--timeout-secs",
            "30",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::AddLastLogin));
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/admins.db")));
        assert_eq!(cli.timeout_secs, Some(30));
    }

    #[test]
    fn pool_config_mirrors_database_config() {
        let mut config = AppConfig::default();
        config.database.max_connections = 2;
        config.database.acquire_timeout_ms = 250;

        let pool = pool_config(&config);
        assert_eq!(pool.max_connections, 2);
        assert_eq!(pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(pool.busy_timeout, Duration::from_secs(5));
    }

    #[test]
    fn execute_maps_outcome_to_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("admins.db");
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE admins (id INTEGER PRIMARY KEY, role TEXT NOT NULL);
                 INSERT INTO admins VALUES (1, 'admin');",
            )
            .unwrap();
        let pool = ConnectionPool::open(&db_path, PoolConfig::default()).unwrap();

        let first = execute(&pool, &PromoteToSuperAdmin::new(1), None);
        assert!(matches!(first, MigrationOutcome::Applied));
        assert_eq!(exit_status(&first), 0);

        let second = execute(&pool, &PromoteToSuperAdmin::new(1), None);
        assert!(matches!(second, MigrationOutcome::Skipped));
        assert_eq!(exit_status(&second), 0);

        let empty = dir.path().join("empty.db");
        rusqlite::Connection::open(&empty).unwrap();
        let pool = ConnectionPool::open(&empty, PoolConfig::default()).unwrap();
        let failed = execute(&pool, &AddLastLoginColumn, None);
        assert_eq!(exit_status(&failed), 1);
    }

    #[test]
    fn missing_database_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("typo.db");
        let cli = Cli::try_parse_from([
            "backops",
            "status",
            "--database",
            missing.to_str().unwrap(),
        ])
        .unwrap();

        let err = run(cli).unwrap_err();
        assert!(format!("{err:#}").contains("does not exist"), "{err:#}");
        assert!(!missing.exists());
    }
}
