use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::domain::{Cents, Currency};

use super::{BALANCE_MIGRATION_001_INITIAL, format_timestamp, open_pool};

/// Authoritative store of spendable funds per (user, currency).
///
/// Every mutation is a single atomic primitive; callers never read a balance
/// and write it back. Mutations are keyed: a key that was already applied is
/// a no-op, which is what lets the saga retry and compensate safely.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Add `amount` to the balance, creating it at zero on first use.
    /// Returns false if `dedup_key` was already applied.
    async fn increment_balance(
        &self,
        user_id: &str,
        currency: Currency,
        amount: Cents,
        dedup_key: &str,
    ) -> Result<bool>;

    /// Subtract `amount` only if the current balance covers it. Returns false
    /// without touching state when funds are insufficient. A successful
    /// decrement is journaled as a reservation under `reservation_key`.
    async fn decrement_balance_if_sufficient(
        &self,
        user_id: &str,
        currency: Currency,
        amount: Cents,
        reservation_key: &str,
    ) -> Result<bool>;

    /// Credit back a reservation, at most once. Returns false when the
    /// reservation never applied or was already released.
    async fn release_reservation(&self, reservation_key: &str) -> Result<bool>;

    /// Current balance, zero if the user never held this currency.
    async fn balance(&self, user_id: &str, currency: Currency) -> Result<Cents>;
}

/// Balance store backed by its own SQLite database.
#[derive(Clone)]
pub struct SqliteBalanceStore {
    pool: SqlitePool,
}

impl SqliteBalanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(open_pool(database_url).await?))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(BALANCE_MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run balance migration 001")?;
        Ok(())
    }

    /// Connect + migrate.
    pub async fn init(database_url: &str) -> Result<Self> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    fn ensure_positive(amount: Cents) -> Result<()> {
        if amount <= 0 {
            bail!("Balance mutation amount must be positive, got {}", amount);
        }
        Ok(())
    }
}

#[async_trait]
impl BalanceStore for SqliteBalanceStore {
    async fn increment_balance(
        &self,
        user_id: &str,
        currency: Currency,
        amount: Cents,
        dedup_key: &str,
    ) -> Result<bool> {
        Self::ensure_positive(amount)?;
        let now = format_timestamp(Utc::now());
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin balance transaction")?;

        // Claim the key first; the write lock is taken on this statement.
        let claimed = sqlx::query(
            r#"
            INSERT INTO balance_operations (op_key, user_id, currency, amount_cents, kind, created_at)
            VALUES (?, ?, ?, ?, 'credit', ?)
            ON CONFLICT (op_key) DO NOTHING
            "#,
        )
        .bind(dedup_key)
        .bind(user_id)
        .bind(currency.as_str())
        .bind(amount)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("Failed to record balance credit")?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await.context("Failed to roll back duplicate credit")?;
            return Ok(false);
        }

        // SQLite would silently widen an overflowing sum to REAL
        let credited = sqlx::query(
            r#"
            INSERT INTO balances (user_id, currency, amount_cents, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id, currency)
            DO UPDATE SET amount_cents = amount_cents + excluded.amount_cents,
                          updated_at = excluded.updated_at
            WHERE amount_cents <= 9223372036854775807 - excluded.amount_cents
            "#,
        )
        .bind(user_id)
        .bind(currency.as_str())
        .bind(amount)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("Failed to increment balance")?
        .rows_affected();

        if credited == 0 {
            tx.rollback().await.context("Failed to roll back balance credit")?;
            bail!(
                "Crediting {} to {} ({}) would overflow the balance",
                amount,
                user_id,
                currency
            );
        }

        tx.commit().await.context("Failed to commit balance credit")?;
        Ok(true)
    }

    async fn decrement_balance_if_sufficient(
        &self,
        user_id: &str,
        currency: Currency,
        amount: Cents,
        reservation_key: &str,
    ) -> Result<bool> {
        Self::ensure_positive(amount)?;
        let now = format_timestamp(Utc::now());
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin balance transaction")?;

        // The funds check and the subtraction are one statement.
        let updated = sqlx::query(
            r#"
            UPDATE balances
            SET amount_cents = amount_cents - ?, updated_at = ?
            WHERE user_id = ? AND currency = ? AND amount_cents >= ?
            "#,
        )
        .bind(amount)
        .bind(&now)
        .bind(user_id)
        .bind(currency.as_str())
        .bind(amount)
        .execute(&mut *tx)
        .await
        .context("Failed to decrement balance")?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.context("Failed to roll back decrement")?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO balance_operations (op_key, user_id, currency, amount_cents, kind, created_at)
            VALUES (?, ?, ?, ?, 'reserve', ?)
            "#,
        )
        .bind(reservation_key)
        .bind(user_id)
        .bind(currency.as_str())
        .bind(amount)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to record reservation {}", reservation_key))?;

        tx.commit().await.context("Failed to commit reservation")?;
        Ok(true)
    }

    async fn release_reservation(&self, reservation_key: &str) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin balance transaction")?;

        let row = sqlx::query(
            r#"
            UPDATE balance_operations
            SET released_at = ?
            WHERE op_key = ? AND kind = 'reserve' AND released_at IS NULL
            RETURNING user_id, currency, amount_cents
            "#,
        )
        .bind(&now)
        .bind(reservation_key)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to mark reservation released")?;

        let Some(row) = row else {
            tx.rollback().await.context("Failed to roll back release")?;
            return Ok(false);
        };

        let user_id: String = row.try_get("user_id")?;
        let currency: String = row.try_get("currency")?;
        let amount: Cents = row
            .try_get("amount_cents")
            .context("Reservation amount is not an integer")?;

        sqlx::query(
            r#"
            UPDATE balances
            SET amount_cents = amount_cents + ?, updated_at = ?
            WHERE user_id = ? AND currency = ?
            "#,
        )
        .bind(amount)
        .bind(&now)
        .bind(&user_id)
        .bind(&currency)
        .execute(&mut *tx)
        .await
        .context("Failed to refund reservation")?;

        tx.commit().await.context("Failed to commit reservation release")?;
        Ok(true)
    }

    async fn balance(&self, user_id: &str, currency: Currency) -> Result<Cents> {
        let row = sqlx::query(
            "SELECT amount_cents FROM balances WHERE user_id = ? AND currency = ?",
        )
        .bind(user_id)
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch balance")?;

        match row {
            Some(row) => row
                .try_get("amount_cents")
                .with_context(|| format!("Balance of {} ({}) is not an integer", user_id, currency)),
            None => Ok(0),
        }
    }
}
