use thiserror::Error;

use crate::domain::{Cents, Currency, TransactionId, format_cents};

fn display_amount(cents: &Cents) -> String {
    format_cents(*cents)
}

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(
        "Insufficient funds for user {user_id}: requested {} {currency}",
        display_amount(.requested)
    )]
    InsufficientFunds {
        user_id: String,
        currency: Currency,
        requested: Cents,
    },

    /// Ledger insert or commit failed. On withdraw the reserved funds have
    /// already been released when this is returned.
    #[error("Ledger write failed: {0:#}")]
    LedgerWriteFailure(anyhow::Error),

    /// The deposit is durably in the ledger but the balance credit did not
    /// apply. Heal with a resync keyed by `transaction_id`.
    #[error("Balance sync failed for committed transaction {transaction_id}: {source:#}")]
    BalanceSyncFailure {
        transaction_id: TransactionId,
        source: anyhow::Error,
    },

    #[error("Balance store unavailable: {0:#}")]
    BalanceUnavailable(anyhow::Error),

    /// The refund after a ledger failure could not be applied. Needs an
    /// operator: the user's funds are reserved with no ledger row.
    #[error("Compensation failed (reservation {reservation_key}): ledger error: {ledger_error:#}; refund error: {refund_error:#}")]
    CompensationFailed {
        reservation_key: String,
        ledger_error: anyhow::Error,
        refund_error: anyhow::Error,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl WalletError {
    /// Short machine-readable name of the error class, for logs and callers
    /// mapping to their own status codes.
    pub fn kind(&self) -> &'static str {
        match self {
            WalletError::Validation(_) => "validation_error",
            WalletError::InsufficientFunds { .. } => "insufficient_funds",
            WalletError::LedgerWriteFailure(_) => "ledger_write_failure",
            WalletError::BalanceSyncFailure { .. } => "balance_sync_failure",
            WalletError::BalanceUnavailable(_) => "balance_unavailable",
            WalletError::CompensationFailed { .. } => "compensation_failed",
            WalletError::TransactionNotFound(_) => "transaction_not_found",
            WalletError::Storage(_) => "storage_error",
        }
    }

    /// True if no state was mutated before the error was returned.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            WalletError::Validation(_) | WalletError::InsufficientFunds { .. }
        )
    }
}
