mod balance;
mod ledger;

pub use balance::*;
pub use ledger::*;

/// SQL migration for the ledger database (transactions + invoices)
pub const LEDGER_MIGRATION_001_INITIAL: &str = include_str!("migrations/ledger/001_initial.sql");

/// SQL migration for the balance-of-record database
pub const BALANCE_MIGRATION_001_INITIAL: &str =
    include_str!("migrations/balance/001_initial.sql");

/// Timestamp format used for every stored time: fixed-width UTC so
/// lexicographic order equals chronological order.
pub(crate) fn format_timestamp(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    use anyhow::Context;
    Ok(chrono::DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&chrono::Utc))
}

/// Connection options shared by both stores: create the file on demand,
/// WAL journaling, and a busy timeout so concurrent writers queue instead
/// of failing with SQLITE_BUSY.
pub(crate) async fn open_pool(database_url: &str) -> anyhow::Result<sqlx::SqlitePool> {
    use anyhow::Context;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid database URL: {}", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("Failed to connect to database")
}
