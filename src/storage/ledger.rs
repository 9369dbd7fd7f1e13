use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::domain::{
    Currency, Invoice, StatementLine, Transaction, TransactionId, TransactionStatus,
    TransactionType, page_offset,
};

use super::{LEDGER_MIGRATION_001_INITIAL, format_timestamp, open_pool, parse_timestamp};

const TRANSACTION_COLUMNS: &str = "id, user_id, amount_cents, currency, transaction_type, status, description, reference_id, metadata, created_at";

/// Same columns as [`TRANSACTION_COLUMNS`], qualified for joins on `t`
const JOINED_TRANSACTION_COLUMNS: &str = "t.id AS id, t.user_id AS user_id, t.amount_cents AS amount_cents, t.currency AS currency, t.transaction_type AS transaction_type, t.status AS status, t.description AS description, t.reference_id AS reference_id, t.metadata AS metadata, t.created_at AS created_at";

/// Lifecycle of a ledger scope. Once a scope leaves `Open` it can never be
/// finalized again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Committed,
    RolledBack,
}

/// An open ACID unit on the ledger. Inserts are only expressible through a
/// scope, and become visible together on `commit` or not at all.
#[async_trait]
pub trait LedgerScope: Send {
    fn state(&self) -> ScopeState;

    fn is_finished(&self) -> bool {
        self.state() != ScopeState::Open
    }

    async fn create_transaction(&mut self, transaction: &Transaction) -> Result<()>;

    async fn create_invoice(&mut self, invoice: &Invoice) -> Result<()>;

    /// Commit the scope. Errors if the scope already finished.
    async fn commit(&mut self) -> Result<()>;

    /// Roll the scope back. A no-op once the scope has finished.
    async fn rollback(&mut self) -> Result<()>;
}

/// Durable, append-only store of transactions and invoices.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerScope>>;

    /// A page of the user's transactions, newest first, plus the total count.
    async fn get_history(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Transaction>, i64)>;

    /// Like `get_history`, with each row's invoice number joined in.
    async fn get_statement(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<StatementLine>, i64)>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;

    /// The transaction carrying `reference_id`, whichever user owns it.
    /// References are unique across the whole ledger.
    async fn find_by_reference(&self, reference_id: &str) -> Result<Option<Transaction>>;

    async fn get_invoice_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Invoice>>;

    /// All completed transactions of a user in one currency, oldest first.
    async fn list_completed(&self, user_id: &str, currency: Currency)
    -> Result<Vec<Transaction>>;
}

pub type ScopeFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 's>>;

/// Run `f` inside a fresh scope: commit if it succeeds, roll back if it
/// fails. `f` may finalize the scope itself; an already-finished scope is
/// not finalized twice.
pub async fn run_in_transaction<T, F>(store: &dyn LedgerStore, f: F) -> Result<T>
where
    F: for<'s> FnOnce(&'s mut Box<dyn LedgerScope>) -> ScopeFuture<'s, T>,
{
    let mut scope = store.begin().await?;
    let result = match f(&mut scope).await {
        Ok(value) if scope.is_finished() => Ok(value),
        Ok(value) => scope.commit().await.map(|_| value),
        Err(err) => Err(err),
    };

    if result.is_err() && !scope.is_finished() {
        if let Err(rollback_err) = scope.rollback().await {
            tracing::warn!(error = %rollback_err, "ledger rollback failed");
        }
    }
    result
}

/// Ledger backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(open_pool(database_url).await?))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(LEDGER_MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run ledger migration 001")?;
        Ok(())
    }

    /// Connect + migrate.
    pub async fn init(database_url: &str) -> Result<Self> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Count every transaction row (all users). Used by integrity checks.
    pub async fn count_transactions(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM transactions")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count transactions")?;
        Ok(row.get("count"))
    }

    /// Count every invoice row (all users).
    pub async fn count_invoices(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM invoices")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count invoices")?;
        Ok(row.get("count"))
    }

    async fn count_history(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as total FROM transactions WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count history")?;
        Ok(row.get("total"))
    }

    fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction> {
        let id_str: String = row.get("id");
        let currency_str: String = row.get("currency");
        let type_str: String = row.get("transaction_type");
        let status_str: String = row.get("status");
        let metadata_str: String = row.get("metadata");
        let created_at_str: String = row.get("created_at");

        Ok(Transaction {
            id: Uuid::parse_str(&id_str).context("Invalid transaction ID")?,
            user_id: row.get("user_id"),
            amount: row.get("amount_cents"),
            currency: Currency::from_str(&currency_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid currency: {}", currency_str))?,
            transaction_type: TransactionType::from_str(&type_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction type: {}", type_str))?,
            status: TransactionStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction status: {}", status_str))?,
            description: row.get("description"),
            reference_id: row.get("reference_id"),
            metadata: serde_json::from_str(&metadata_str).context("Invalid metadata JSON")?,
            created_at: parse_timestamp(&created_at_str)?,
        })
    }

    fn row_to_invoice(row: &sqlx::sqlite::SqliteRow) -> Result<Invoice> {
        let id_str: String = row.get("id");
        let transaction_id_str: String = row.get("transaction_id");
        let currency_str: String = row.get("currency");
        let billing_str: String = row.get("billing_details");
        let issued_at_str: String = row.get("issued_at");

        Ok(Invoice {
            id: Uuid::parse_str(&id_str).context("Invalid invoice ID")?,
            transaction_id: Uuid::parse_str(&transaction_id_str)
                .context("Invalid invoice transaction ID")?,
            invoice_number: row.get("invoice_number"),
            amount: row.get("amount_cents"),
            currency: Currency::from_str(&currency_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid currency: {}", currency_str))?,
            billing_details: serde_json::from_str(&billing_str)
                .context("Invalid billing details JSON")?,
            issued_at: parse_timestamp(&issued_at_str)?,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerScope>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to open ledger scope")?;
        Ok(Box::new(SqliteLedgerScope {
            tx: Some(tx),
            state: ScopeState::Open,
        }))
    }

    async fn get_history(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Transaction>, i64)> {
        let total = self.count_history(user_id).await?;

        let query = format!(
            "SELECT {} FROM transactions WHERE user_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(i64::from(limit))
            .bind(page_offset(page, limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch history")?;

        let transactions = rows
            .iter()
            .map(Self::row_to_transaction)
            .collect::<Result<Vec<_>>>()?;
        Ok((transactions, total))
    }

    async fn get_statement(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<StatementLine>, i64)> {
        let total = self.count_history(user_id).await?;

        let query = format!(
            r#"
            SELECT {}, i.invoice_number AS invoice_number
            FROM transactions t
            LEFT JOIN invoices i ON i.transaction_id = t.id
            WHERE t.user_id = ?
            ORDER BY t.created_at DESC, t.rowid DESC
            LIMIT ? OFFSET ?
            "#,
            JOINED_TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(i64::from(limit))
            .bind(page_offset(page, limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch statement")?;

        let lines = rows
            .iter()
            .map(|row| -> Result<StatementLine> {
                Ok(StatementLine {
                    transaction: Self::row_to_transaction(row)?,
                    invoice_number: row.try_get("invoice_number")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((lines, total))
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let query = format!("SELECT {} FROM transactions WHERE id = ?", TRANSACTION_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transaction")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn find_by_reference(&self, reference_id: &str) -> Result<Option<Transaction>> {
        let query = format!(
            "SELECT {} FROM transactions WHERE reference_id = ?",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transaction by reference")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn get_invoice_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Invoice>> {
        let row = sqlx::query(
            r#"
            SELECT id, transaction_id, invoice_number, amount_cents, currency, billing_details, issued_at
            FROM invoices
            WHERE transaction_id = ?
            "#,
        )
        .bind(transaction_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch invoice")?;

        row.as_ref().map(Self::row_to_invoice).transpose()
    }

    async fn list_completed(
        &self,
        user_id: &str,
        currency: Currency,
    ) -> Result<Vec<Transaction>> {
        let query = format!(
            "SELECT {} FROM transactions WHERE user_id = ? AND currency = ? AND status = 'COMPLETED' ORDER BY created_at, rowid",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(currency.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list completed transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }
}

struct SqliteLedgerScope {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    state: ScopeState,
}

impl SqliteLedgerScope {
    fn open_tx(&mut self) -> Result<&mut sqlx::Transaction<'static, Sqlite>> {
        match (self.state, self.tx.as_mut()) {
            (ScopeState::Open, Some(tx)) => Ok(tx),
            (state, _) => bail!("Ledger scope already finished ({:?})", state),
        }
    }
}

#[async_trait]
impl LedgerScope for SqliteLedgerScope {
    fn state(&self) -> ScopeState {
        self.state
    }

    async fn create_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        if !transaction.sign_matches_type() {
            bail!(
                "Amount {} does not match transaction type {}",
                transaction.amount,
                transaction.transaction_type
            );
        }
        let metadata_json = serde_json::to_string(&transaction.metadata)?;
        let tx = self.open_tx()?;

        sqlx::query(
            r#"
            INSERT INTO transactions (id, user_id, amount_cents, currency, transaction_type, status, description, reference_id, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(transaction.id.to_string())
        .bind(&transaction.user_id)
        .bind(transaction.amount)
        .bind(transaction.currency.as_str())
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.status.as_str())
        .bind(&transaction.description)
        .bind(&transaction.reference_id)
        .bind(&metadata_json)
        .bind(format_timestamp(transaction.created_at))
        .execute(&mut **tx)
        .await
        .context("Failed to insert transaction")?;

        Ok(())
    }

    async fn create_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        let billing_json = serde_json::to_string(&invoice.billing_details)?;
        let tx = self.open_tx()?;

        sqlx::query(
            r#"
            INSERT INTO invoices (id, transaction_id, invoice_number, amount_cents, currency, billing_details, issued_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(invoice.id.to_string())
        .bind(invoice.transaction_id.to_string())
        .bind(&invoice.invoice_number)
        .bind(invoice.amount)
        .bind(invoice.currency.as_str())
        .bind(&billing_json)
        .bind(format_timestamp(invoice.issued_at))
        .execute(&mut **tx)
        .await
        .context("Failed to insert invoice")?;

        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.open_tx()?;
        let Some(tx) = self.tx.take() else {
            bail!("Ledger scope has no open transaction");
        };
        match tx.commit().await {
            Ok(()) => {
                self.state = ScopeState::Committed;
                Ok(())
            }
            Err(err) => {
                // The connection rolls the transaction back when dropped
                self.state = ScopeState::RolledBack;
                Err(err).context("Failed to commit ledger scope")
            }
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state != ScopeState::Open {
            return Ok(());
        }
        self.state = ScopeState::RolledBack;
        match self.tx.take() {
            Some(tx) => tx.rollback().await.context("Failed to roll back ledger scope"),
            None => Ok(()),
        }
    }
}
