use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, Currency, Transaction, TransactionId};

pub type InvoiceId = Uuid;

/// Invoice bound 1:1 to a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub transaction_id: TransactionId,
    /// Globally unique number (e.g. INV-20240115-9F2C41...)
    pub invoice_number: String,
    /// Absolute value of the transaction amount
    pub amount: Cents,
    pub currency: Currency,
    pub billing_details: BTreeMap<String, String>,
    pub issued_at: DateTime<Utc>,
}

/// Builds invoice rows for transactions.
///
/// The generator only derives the row; persisting it is the caller's job and
/// must happen through the same ledger scope as the transaction insert, so an
/// invoice exists if and only if its transaction commits. Uniqueness of the
/// number is ultimately enforced by the ledger's UNIQUE constraint.
#[derive(Debug, Clone)]
pub struct InvoiceGenerator {
    prefix: String,
}

impl Default for InvoiceGenerator {
    fn default() -> Self {
        Self::new("INV")
    }
}

impl InvoiceGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Next invoice number, grouped by issue date.
    pub fn next_number(&self, issued_at: DateTime<Utc>) -> String {
        format!(
            "{}-{}-{}",
            self.prefix,
            issued_at.format("%Y%m%d"),
            Uuid::new_v4().simple().to_string().to_uppercase()
        )
    }

    /// Derive the invoice for `transaction`, merging `billing_details` over
    /// the defaults taken from the transaction.
    pub fn generate(
        &self,
        transaction: &Transaction,
        billing_details: &BTreeMap<String, String>,
    ) -> Invoice {
        let issued_at = Utc::now().trunc_subsecs(6);

        let mut details = BTreeMap::new();
        details.insert("user_id".to_string(), transaction.user_id.clone());
        if let Some(method) = transaction.metadata.get("method") {
            details.insert("method".to_string(), method.clone());
        }
        details.extend(billing_details.iter().map(|(k, v)| (k.clone(), v.clone())));

        Invoice {
            id: Uuid::new_v4(),
            transaction_id: transaction.id,
            invoice_number: self.next_number(issued_at),
            amount: transaction.billed_amount(),
            currency: transaction.currency,
            billing_details: details,
            issued_at,
        }
    }
}
