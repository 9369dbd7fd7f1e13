use serde::{Deserialize, Serialize};

use super::{Cents, Currency, Transaction};

/// Sum of completed transaction amounts for one user and currency.
/// This is the value the balance-of-record must eventually agree with.
/// `None` if the sum does not fit in [`Cents`].
pub fn ledger_total(
    user_id: &str,
    currency: Currency,
    transactions: &[Transaction],
) -> Option<Cents> {
    transactions
        .iter()
        .filter(|t| t.is_completed() && t.user_id == user_id && t.currency == currency)
        .try_fold(0 as Cents, |total, t| total.checked_add(t.amount))
}

/// One page of a user's ledger history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub transactions: Vec<Transaction>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

impl HistoryPage {
    pub fn new(transactions: Vec<Transaction>, total: i64, page: u32, limit: u32) -> Self {
        Self {
            transactions,
            total,
            page,
            limit,
            total_pages: total_pages(total, limit),
        }
    }
}

/// A history row together with the number of the invoice issued for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementLine {
    pub transaction: Transaction,
    pub invoice_number: Option<String>,
}

/// One page of statement lines, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementPage {
    pub lines: Vec<StatementLine>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

impl StatementPage {
    pub fn new(lines: Vec<StatementLine>, total: i64, page: u32, limit: u32) -> Self {
        Self {
            lines,
            total,
            page,
            limit,
            total_pages: total_pages(total, limit),
        }
    }
}

/// Number of pages needed to show `total` rows at `limit` per page.
pub fn total_pages(total: i64, limit: u32) -> u32 {
    if total <= 0 || limit == 0 {
        return 0;
    }
    let limit = i64::from(limit);
    u32::try_from((total + limit - 1) / limit).unwrap_or(u32::MAX)
}

/// Row offset of a 1-based page.
pub fn page_offset(page: u32, limit: u32) -> i64 {
    i64::from(page.saturating_sub(1)) * i64::from(limit)
}

/// Outcome of comparing the balance-of-record with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub user_id: String,
    pub currency: Currency,
    pub balance: Cents,
    pub ledger_total: Cents,
    /// Deposits whose balance credit was missing and got re-applied
    pub resynced: usize,
}

impl ConsistencyReport {
    /// Balance minus ledger total. Positive means the balance store holds
    /// funds the ledger does not account for.
    /// `None` only if the two sides are too far apart to subtract.
    pub fn difference(&self) -> Option<Cents> {
        self.balance.checked_sub(self.ledger_total)
    }

    pub fn is_consistent(&self) -> bool {
        self.difference() == Some(0)
    }
}
