use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, Currency};

pub type TransactionId = Uuid;

/// Opaque user identifier owned by the user-identity subsystem.
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Purchase,
    Refund,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::Purchase => "PURCHASE",
            TransactionType::Refund => "REFUND",
            TransactionType::Transfer => "TRANSFER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DEPOSIT" => Some(TransactionType::Deposit),
            "WITHDRAWAL" => Some(TransactionType::Withdrawal),
            "PURCHASE" => Some(TransactionType::Purchase),
            "REFUND" => Some(TransactionType::Refund),
            "TRANSFER" => Some(TransactionType::Transfer),
            _ => None,
        }
    }

    /// Returns true if `amount` carries the sign this type requires.
    /// Credits are positive, debits negative; transfers go either way but
    /// are never zero.
    pub fn accepts_amount(&self, amount: Cents) -> bool {
        match self {
            TransactionType::Deposit | TransactionType::Refund => amount > 0,
            TransactionType::Withdrawal | TransactionType::Purchase => amount < 0,
            TransactionType::Transfer => amount != 0,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(TransactionStatus::Pending),
            "COMPLETED" => Some(TransactionStatus::Completed),
            "FAILED" => Some(TransactionStatus::Failed),
            "CANCELLED" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A ledger row. Transactions are immutable once committed; corrections are
/// new rows, never updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    /// Signed amount in cents: positive credits, negative debits
    pub amount: Cents,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub description: Option<String>,
    /// External correlation id, unique across the ledger
    pub reference_id: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// A completed credit of `amount` cents.
    pub fn deposit(user_id: impl Into<UserId>, amount: Cents, currency: Currency) -> Self {
        Self::new(
            user_id.into(),
            amount.abs(),
            currency,
            TransactionType::Deposit,
        )
    }

    /// A completed debit of `amount` cents. The stored amount is negative.
    pub fn withdrawal(user_id: impl Into<UserId>, amount: Cents, currency: Currency) -> Self {
        Self::new(
            user_id.into(),
            -amount.abs(),
            currency,
            TransactionType::Withdrawal,
        )
    }

    fn new(
        user_id: UserId,
        amount: Cents,
        currency: Currency,
        transaction_type: TransactionType,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            user_id,
            amount,
            currency,
            transaction_type,
            status: TransactionStatus::Completed,
            description: None,
            reference_id: format!("ref_{}", id.simple()),
            metadata: BTreeMap::new(),
            // Stored with microsecond precision
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = reference_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns true if the sign of the amount matches the transaction type.
    pub fn sign_matches_type(&self) -> bool {
        self.transaction_type.accepts_amount(self.amount)
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }

    /// Absolute amount, as billed on the invoice.
    pub fn billed_amount(&self) -> Cents {
        self.amount.abs()
    }
}
