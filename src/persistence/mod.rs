//! Persistence Layer
//!
//! SQLite storage for positions and the settlement ledger, via sqlx, plus an
//! in-memory store with the same semantics for tests and embedding.
//!
//! # Database Schema
//!
//! ## positions
//! One row per position. Trailing-stop state and closing data are nullable columns;
//! `status` moves `open -> closing -> closed` and is never deleted.
//!
//! ## position_receipts
//! Per-exchange fills, keyed by position id.
//!
//! ## ledger_entries / commission_records
//! Append-only money rows, written in the same transaction as the close.
//!
//! ## reconciliation_flags
//! Exchange-side closes that exhausted their retries.

pub mod memory;
pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::domain::errors::StoreError;

pub use memory::InMemoryStore;
pub use repository::SqliteStore;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

impl From<DatabaseError> for StoreError {
    fn from(error: DatabaseError) -> Self {
        StoreError::Backend(error.to_string())
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/lifeguard.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/lifeguard.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            log_queries: false,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Initialize the database connection pool and run migrations
pub async fn init_database(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    // Ensure data directory exists
    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true);
    options = if config.log_queries {
        options.log_statements(tracing::log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };

    // Every connection to :memory: is its own database, so pin the pool to one
    // connection that never expires.
    let pool_options = if config.is_in_memory() {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections)
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "positions table",
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            entry_price REAL NOT NULL,
            quantity REAL NOT NULL,
            leverage REAL NOT NULL,
            stop_loss_price REAL NOT NULL,
            take_profit_price REAL NOT NULL,
            trailing_offset REAL,
            trailing_best REAL,
            trailing_threshold REAL,
            status TEXT NOT NULL CHECK(status IN ('opening', 'open', 'closing', 'closed')),
            signal_source TEXT NOT NULL DEFAULT '',
            opened_at DATETIME NOT NULL,
            exit_price REAL,
            realized_pnl REAL,
            close_reason TEXT,
            closed_at DATETIME
        )
        "#,
    ),
    (
        "position_receipts table",
        r#"
        CREATE TABLE IF NOT EXISTS position_receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            position_id TEXT NOT NULL,
            exchange TEXT NOT NULL,
            credential_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            filled_quantity REAL NOT NULL,
            filled_price REAL NOT NULL,
            placed_at DATETIME NOT NULL,
            FOREIGN KEY (position_id) REFERENCES positions(id)
        )
        "#,
    ),
    (
        "ledger_entries table",
        r#"
        CREATE TABLE IF NOT EXISTS ledger_entries (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            position_id TEXT,
            kind TEXT NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "commission_records table",
        r#"
        CREATE TABLE IF NOT EXISTS commission_records (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            position_id TEXT NOT NULL UNIQUE,
            rate REAL NOT NULL,
            pnl REAL NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            created_at DATETIME NOT NULL,
            FOREIGN KEY (position_id) REFERENCES positions(id)
        )
        "#,
    ),
    (
        "reconciliation_flags table",
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_flags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            position_id TEXT NOT NULL,
            exchange TEXT NOT NULL,
            credential_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            reason TEXT NOT NULL,
            flagged_at DATETIME NOT NULL,
            resolved BOOLEAN NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        "positions status index",
        "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
    ),
    (
        "positions user index",
        "CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id, opened_at)",
    ),
    (
        "receipts position index",
        "CREATE INDEX IF NOT EXISTS idx_receipts_position ON position_receipts(position_id)",
    ),
    (
        "ledger user index",
        "CREATE INDEX IF NOT EXISTS idx_ledger_user ON ledger_entries(user_id, created_at)",
    ),
];

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    for (name, statement) in MIGRATIONS {
        sqlx::query(statement).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {}: {}", name, e))
        })?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}
