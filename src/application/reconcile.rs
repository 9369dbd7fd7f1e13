use anyhow::anyhow;
use tracing::{info, instrument, warn};

use crate::domain::{ConsistencyReport, Currency, TransactionType, ledger_total};

use super::{SagaOrchestrator, WalletError};

impl SagaOrchestrator {
    /// One reconciliation sweep for a user and currency.
    ///
    /// Re-applies the balance credit of every completed deposit (a no-op for
    /// deposits that were already credited), then compares the
    /// balance-of-record with the ledger. Any remaining difference is
    /// reported, not corrected: only deposits have a credit key the sweep can
    /// safely replay.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        user_id: &str,
        currency: Currency,
    ) -> Result<ConsistencyReport, WalletError> {
        let completed = self.ledger.list_completed(user_id, currency).await?;

        let mut resynced = 0;
        for transaction in completed
            .iter()
            .filter(|t| t.transaction_type == TransactionType::Deposit)
        {
            let key = crate::domain::deposit_credit_key(transaction.id);
            let applied = self
                .step(
                    "balance increment",
                    self.balances.increment_balance(
                        user_id,
                        currency,
                        transaction.billed_amount(),
                        &key,
                    ),
                )
                .await
                .map_err(|source| WalletError::BalanceSyncFailure {
                    transaction_id: transaction.id,
                    source,
                })?;
            if applied {
                warn!(transaction_id = %transaction.id, "reconciliation credited a missing deposit");
                resynced += 1;
            }
        }

        let balance = self.balances.balance(user_id, currency).await?;
        let total = ledger_total(user_id, currency, &completed).ok_or_else(|| {
            anyhow!("Ledger total for {} ({}) overflows", user_id, currency)
        })?;
        let report = ConsistencyReport {
            user_id: user_id.to_string(),
            currency,
            balance,
            ledger_total: total,
            resynced,
        };

        if report.is_consistent() {
            info!(balance, resynced, "balance and ledger agree");
        } else {
            warn!(
                balance = report.balance,
                ledger_total = report.ledger_total,
                difference = ?report.difference(),
                "balance and ledger diverge"
            );
        }
        Ok(report)
    }
}
