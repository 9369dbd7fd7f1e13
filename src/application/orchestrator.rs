use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{Instrument, error, info, instrument, warn};

use crate::domain::{
    Cents, Currency, HistoryPage, Invoice, InvoiceGenerator, MAX_AMOUNT, Saga, SagaKind,
    SagaState, StatementPage, Transaction, TransactionId, TransactionType, UserId,
    deposit_credit_key, format_cents,
};
use crate::storage::{
    BalanceStore, LedgerStore, SqliteBalanceStore, SqliteLedgerStore, run_in_transaction,
};

use super::{SagaConfig, WalletError};

/// A deposit or withdrawal as submitted by a caller. Payments are already
/// authorized by the time they reach the orchestrator.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub user_id: UserId,
    pub amount: Cents,
    pub currency: Currency,
    pub method: String,
    /// Caller-supplied idempotency reference. A repeated reference returns
    /// the original transaction instead of moving funds again.
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub billing_details: BTreeMap<String, String>,
}

impl PaymentRequest {
    pub fn new(
        user_id: impl Into<UserId>,
        amount: Cents,
        currency: Currency,
        method: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            currency,
            method: method.into(),
            reference_id: None,
            description: None,
            billing_details: BTreeMap::new(),
        }
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_billing_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.billing_details.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), WalletError> {
        if self.amount <= 0 {
            return Err(WalletError::Validation(format!(
                "Amount must be positive, got {}",
                self.amount
            )));
        }
        if self.amount > MAX_AMOUNT {
            return Err(WalletError::Validation(format!(
                "Amount must not exceed {}, got {}",
                format_cents(MAX_AMOUNT),
                format_cents(self.amount)
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(WalletError::Validation("User id must not be empty".into()));
        }
        if self.method.trim().is_empty() {
            return Err(WalletError::Validation("Payment method must not be empty".into()));
        }
        if matches!(&self.reference_id, Some(r) if r.trim().is_empty()) {
            return Err(WalletError::Validation("Reference must not be empty".into()));
        }
        Ok(())
    }

    fn to_transaction(&self, transaction_type: TransactionType) -> Transaction {
        let mut transaction = match transaction_type {
            TransactionType::Withdrawal => {
                Transaction::withdrawal(self.user_id.clone(), self.amount, self.currency)
            }
            _ => Transaction::deposit(self.user_id.clone(), self.amount, self.currency),
        }
        .with_metadata("method", self.method.clone());

        if let Some(reference) = &self.reference_id {
            transaction = transaction.with_reference(reference.clone());
        }
        if let Some(description) = &self.description {
            transaction = transaction.with_description(description.clone());
        }
        transaction
    }

    /// Whether `existing` is the ledger row this request already produced.
    fn matches(&self, existing: &Transaction, transaction_type: TransactionType) -> bool {
        existing.transaction_type == transaction_type
            && existing.currency == self.currency
            && existing.billed_amount() == self.amount
    }
}

/// A committed transaction together with its invoice.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub transaction: Transaction,
    pub invoice: Option<Invoice>,
}

/// Keeps the balance-of-record and the ledger consistent across deposits
/// and withdrawals.
///
/// The two stores never share a transaction. Deposits write the ledger first
/// and credit the balance after; withdrawals reserve funds first and release
/// them again if the ledger write fails. A deposit whose credit fails after
/// the ledger commit is reported as [`WalletError::BalanceSyncFailure`] and
/// healed by [`SagaOrchestrator::resync_deposit`] or
/// [`SagaOrchestrator::reconcile`], both keyed by the transaction id so the
/// credit applies at most once.
#[derive(Clone)]
pub struct SagaOrchestrator {
    pub(super) balances: Arc<dyn BalanceStore>,
    pub(super) ledger: Arc<dyn LedgerStore>,
    invoices: InvoiceGenerator,
    pub(super) config: SagaConfig,
}

impl SagaOrchestrator {
    pub fn new(balances: Arc<dyn BalanceStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            balances,
            ledger,
            invoices: InvoiceGenerator::default(),
            config: SagaConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_invoice_generator(mut self, invoices: InvoiceGenerator) -> Self {
        self.invoices = invoices;
        self
    }

    /// Create (if needed) and migrate both SQLite databases.
    pub async fn init(ledger_path: &str, balance_path: &str) -> Result<Self, WalletError> {
        let ledger = SqliteLedgerStore::init(&format!("sqlite:{}", ledger_path)).await?;
        let balances = SqliteBalanceStore::init(&format!("sqlite:{}", balance_path)).await?;
        Ok(Self::new(Arc::new(balances), Arc::new(ledger)))
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    // ========================
    // Deposit
    // ========================

    /// Credit `amount` to the user's balance and record it in the ledger.
    pub async fn deposit(
        &self,
        user_id: &str,
        amount: Cents,
        currency: Currency,
        method: &str,
    ) -> Result<Transaction, WalletError> {
        self.execute_deposit(PaymentRequest::new(user_id, amount, currency, method))
            .await
    }

    #[instrument(
        name = "deposit",
        skip(self, request),
        fields(user_id = %request.user_id, currency = %request.currency, amount = request.amount)
    )]
    pub async fn execute_deposit(&self, request: PaymentRequest) -> Result<Transaction, WalletError> {
        request.validate()?;

        if let Some(existing) = self.find_replay(&request).await? {
            return self.replay_deposit(existing, &request).await;
        }

        let mut saga = Saga::new(SagaKind::Deposit);
        let transaction = request.to_transaction(TransactionType::Deposit);
        let invoice = self.invoices.generate(&transaction, &request.billing_details);

        // Transaction and invoice commit together or not at all
        let row = transaction.clone();
        let committed = self
            .step(
                "ledger commit",
                run_in_transaction(self.ledger.as_ref(), move |scope| {
                    Box::pin(async move {
                        scope.create_transaction(&row).await?;
                        scope.create_invoice(&invoice).await?;
                        Ok::<_, anyhow::Error>(())
                    })
                }),
            )
            .await;

        if let Err(ledger_error) = committed {
            // A concurrent call with the same reference may have won the insert
            if let Some(existing) = self.find_replay(&request).await? {
                mark(&mut saga, SagaState::Failed);
                return self.replay_deposit(existing, &request).await;
            }
            mark(&mut saga, SagaState::Failed);
            warn!(saga_id = %saga.id, error = %format!("{:#}", ledger_error), "deposit ledger write failed, nothing mutated");
            return Err(WalletError::LedgerWriteFailure(ledger_error));
        }
        mark(&mut saga, SagaState::LedgerCommitted);

        self.sync_deposit_balance(&transaction).await.inspect_err(|_| {
            mark(&mut saga, SagaState::Failed);
        })?;
        mark(&mut saga, SagaState::BalanceSynced);

        info!(saga_id = %saga.id, transaction_id = %transaction.id, "deposit completed");
        Ok(transaction)
    }

    /// Credit the balance for a committed deposit, at most once.
    async fn sync_deposit_balance(&self, transaction: &Transaction) -> Result<bool, WalletError> {
        let key = deposit_credit_key(transaction.id);
        self.step(
            "balance increment",
            self.balances.increment_balance(
                &transaction.user_id,
                transaction.currency,
                transaction.billed_amount(),
                &key,
            ),
        )
        .await
        .map_err(|source| {
            error!(
                transaction_id = %transaction.id,
                user_id = %transaction.user_id,
                currency = %transaction.currency,
                amount = transaction.amount,
                error = %format!("{:#}", source),
                "deposit committed to ledger but balance credit failed; resync required"
            );
            WalletError::BalanceSyncFailure {
                transaction_id: transaction.id,
                source,
            }
        })
    }

    async fn replay_deposit(
        &self,
        existing: Transaction,
        request: &PaymentRequest,
    ) -> Result<Transaction, WalletError> {
        if !request.matches(&existing, TransactionType::Deposit) {
            return Err(WalletError::Validation(format!(
                "Reference {} already used for a different operation",
                existing.reference_id
            )));
        }
        // The original call may have died between ledger commit and credit
        if self.sync_deposit_balance(&existing).await? {
            warn!(transaction_id = %existing.id, "replayed deposit applied a missing balance credit");
        }
        info!(transaction_id = %existing.id, "deposit replayed by reference");
        Ok(existing)
    }

    // ========================
    // Withdraw
    // ========================

    /// Debit `amount` from the user's balance and record it in the ledger.
    pub async fn withdraw(
        &self,
        user_id: &str,
        amount: Cents,
        currency: Currency,
        method: &str,
    ) -> Result<Transaction, WalletError> {
        self.execute_withdraw(PaymentRequest::new(user_id, amount, currency, method))
            .await
    }

    #[instrument(
        name = "withdraw",
        skip(self, request),
        fields(user_id = %request.user_id, currency = %request.currency, amount = request.amount)
    )]
    pub async fn execute_withdraw(&self, request: PaymentRequest) -> Result<Transaction, WalletError> {
        request.validate()?;

        if let Some(existing) = self.find_replay(&request).await? {
            if !request.matches(&existing, TransactionType::Withdrawal) {
                return Err(WalletError::Validation(format!(
                    "Reference {} already used for a different operation",
                    existing.reference_id
                )));
            }
            info!(transaction_id = %existing.id, "withdrawal replayed by reference");
            return Ok(existing);
        }

        let mut saga = Saga::new(SagaKind::Withdraw);
        let reservation_key = saga.reservation_key();

        let reserved = self
            .step(
                "reserve funds",
                self.balances.decrement_balance_if_sufficient(
                    &request.user_id,
                    request.currency,
                    request.amount,
                    &reservation_key,
                ),
            )
            .await;

        match reserved {
            Ok(true) => mark(&mut saga, SagaState::FundsReserved),
            Ok(false) => {
                mark(&mut saga, SagaState::Failed);
                info!(saga_id = %saga.id, "withdrawal rejected: insufficient funds");
                return Err(WalletError::InsufficientFunds {
                    user_id: request.user_id,
                    currency: request.currency,
                    requested: request.amount,
                });
            }
            Err(balance_error) => {
                // The reservation may or may not have applied: release by key
                mark(&mut saga, SagaState::FundsReserved);
                warn!(saga_id = %saga.id, error = %format!("{:#}", balance_error), "reservation outcome unknown, releasing");
                return match self.release_reserved_funds(&mut saga).await {
                    Ok(_) => Err(WalletError::BalanceUnavailable(balance_error)),
                    Err(refund_error) => Err(WalletError::CompensationFailed {
                        reservation_key,
                        ledger_error: balance_error,
                        refund_error,
                    }),
                };
            }
        }

        // Funds are reserved: finish on a detached task so a dropped caller
        // cannot leave the saga half-done.
        let this = self.clone();
        let span = tracing::Span::current();
        let handle = tokio::spawn(
            async move { this.commit_withdrawal(saga, request).await }.instrument(span),
        );
        match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(reservation_key = %reservation_key, error = %join_error, "withdrawal task aborted with funds reserved");
                Err(WalletError::Storage(anyhow!(
                    "withdrawal task aborted: {}",
                    join_error
                )))
            }
        }
    }

    async fn commit_withdrawal(
        &self,
        mut saga: Saga,
        request: PaymentRequest,
    ) -> Result<Transaction, WalletError> {
        let transaction = request.to_transaction(TransactionType::Withdrawal);
        let invoice = self.invoices.generate(&transaction, &request.billing_details);

        match self.write_ledger(&transaction, &invoice).await {
            Ok(()) => {
                mark(&mut saga, SagaState::LedgerCommitted);
                // The balance already moved when the funds were reserved
                mark(&mut saga, SagaState::BalanceSynced);
                info!(saga_id = %saga.id, transaction_id = %transaction.id, "withdrawal completed");
                Ok(transaction)
            }
            Err(ledger_error) => {
                warn!(saga_id = %saga.id, error = %format!("{:#}", ledger_error), "withdrawal ledger write failed, compensating");
                match self.release_reserved_funds(&mut saga).await {
                    Ok(_) => Err(WalletError::LedgerWriteFailure(ledger_error)),
                    Err(refund_error) => Err(WalletError::CompensationFailed {
                        reservation_key: saga.reservation_key(),
                        ledger_error,
                        refund_error,
                    }),
                }
            }
        }
    }

    /// Insert transaction + invoice through one explicit scope, rolling it
    /// back on any failure unless it already finished.
    async fn write_ledger(&self, transaction: &Transaction, invoice: &Invoice) -> anyhow::Result<()> {
        let mut scope = self.step("open ledger scope", self.ledger.begin()).await?;

        let result = async {
            self.step("insert transaction", scope.create_transaction(transaction))
                .await?;
            self.step("insert invoice", scope.create_invoice(invoice))
                .await?;
            self.step("commit ledger scope", scope.commit()).await
        }
        .await;

        if result.is_err() && !scope.is_finished() {
            if let Err(rollback_error) = self.step("roll back ledger scope", scope.rollback()).await {
                warn!(error = %format!("{:#}", rollback_error), "ledger rollback failed; scope dropped");
            }
        }
        result
    }

    /// Compensation: give reserved funds back. Retried with backoff since the
    /// release is keyed and applies at most once. Exhausting the retries is
    /// escalated, never swallowed.
    async fn release_reserved_funds(&self, saga: &mut Saga) -> anyhow::Result<bool> {
        let key = saga.reservation_key();
        if !saga.owes_compensation() {
            warn!(saga_id = %saga.id, state = saga.state().as_str(), "no reserved funds to release");
            return Ok(false);
        }
        let attempts = self.config.compensation_attempts.max(1);
        let mut delay = self.config.compensation_backoff;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .step("release reservation", self.balances.release_reservation(&key))
                .await
            {
                Ok(released) => {
                    mark(saga, SagaState::Compensated);
                    info!(saga_id = %saga.id, released, attempt, "reserved funds released");
                    return Ok(released);
                }
                Err(err) => {
                    warn!(saga_id = %saga.id, attempt, error = %format!("{:#}", err), "releasing reserved funds failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        mark(saga, SagaState::Failed);
        let refund_error = last_error.unwrap_or_else(|| anyhow!("no release attempt was made"));
        error!(
            saga_id = %saga.id,
            reservation_key = %key,
            attempts,
            error = %format!("{:#}", refund_error),
            "COMPENSATION FAILED: reserved funds are held without a ledger record"
        );
        Err(refund_error)
    }

    // ========================
    // Queries
    // ========================

    /// One page of the user's ledger history, newest first.
    pub async fn get_history(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<HistoryPage, WalletError> {
        self.check_paging(page, limit)?;
        let (transactions, total) = self.ledger.get_history(user_id, page, limit).await?;
        Ok(HistoryPage::new(transactions, total, page, limit))
    }

    /// One page of history with invoice numbers, in a single ledger query.
    pub async fn get_statement(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<StatementPage, WalletError> {
        self.check_paging(page, limit)?;
        let (lines, total) = self.ledger.get_statement(user_id, page, limit).await?;
        Ok(StatementPage::new(lines, total, page, limit))
    }

    fn check_paging(&self, page: u32, limit: u32) -> Result<(), WalletError> {
        if page < 1 {
            return Err(WalletError::Validation("Page must be at least 1".into()));
        }
        if limit < 1 || limit > self.config.max_page_size {
            return Err(WalletError::Validation(format!(
                "Limit must be between 1 and {}",
                self.config.max_page_size
            )));
        }
        Ok(())
    }

    /// Spendable balance from the balance-of-record.
    pub async fn balance(&self, user_id: &str, currency: Currency) -> Result<Cents, WalletError> {
        Ok(self.balances.balance(user_id, currency).await?)
    }

    /// A transaction and its invoice.
    pub async fn get_transaction(&self, id: TransactionId) -> Result<TransactionInfo, WalletError> {
        let transaction = self
            .ledger
            .get_transaction(id)
            .await?
            .ok_or_else(|| WalletError::TransactionNotFound(id.to_string()))?;
        let invoice = self.ledger.get_invoice_for_transaction(id).await?;

        Ok(TransactionInfo {
            transaction,
            invoice,
        })
    }

    /// Re-apply the balance credit of a committed deposit. Returns true if
    /// the credit was missing and has now been applied.
    #[instrument(skip(self))]
    pub async fn resync_deposit(&self, id: TransactionId) -> Result<bool, WalletError> {
        let TransactionInfo { transaction, .. } = self.get_transaction(id).await?;
        if transaction.transaction_type != TransactionType::Deposit || !transaction.is_completed() {
            return Err(WalletError::Validation(format!(
                "Transaction {} is not a completed deposit",
                id
            )));
        }

        let applied = self.sync_deposit_balance(&transaction).await?;
        if applied {
            warn!(transaction_id = %id, "resync applied a missing deposit credit");
        }
        Ok(applied)
    }

    /// The transaction a repeated reference points at. A reference owned by
    /// another user is rejected before anything is mutated.
    async fn find_replay(&self, request: &PaymentRequest) -> Result<Option<Transaction>, WalletError> {
        let Some(reference) = &request.reference_id else {
            return Ok(None);
        };
        match self.ledger.find_by_reference(reference).await? {
            Some(existing) if existing.user_id != request.user_id => {
                warn!(reference_id = %reference, "reference already used by another user");
                Err(WalletError::Validation(format!(
                    "Reference {} is already in use",
                    reference
                )))
            }
            found => Ok(found),
        }
    }

    /// Run one store call under the per-step deadline.
    pub(super) async fn step<T, F>(&self, name: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.step_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "{} timed out after {:?}",
                name,
                self.config.step_timeout
            )),
        }
    }
}

/// Advance the saga. Transitions made here are fixed by the code paths
/// above; an illegal one is logged rather than aborting a saga midway.
fn mark(saga: &mut Saga, to: SagaState) {
    if let Err(err) = saga.advance(to) {
        error!(saga_id = %saga.id, error = %err, "saga transition rejected");
    }
}
