// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use saldo::application::{SagaConfig, SagaOrchestrator};
use saldo::domain::{Cents, Currency, Invoice, StatementLine, Transaction, TransactionId};
use saldo::storage::{
    BalanceStore, LedgerScope, LedgerStore, ScopeState, SqliteBalanceStore, SqliteLedgerStore,
};
use tempfile::TempDir;

/// Long enough that only a step deadline ends it
const HANG: Duration = Duration::from_secs(60);

/// Orchestrator over real SQLite stores wrapped in fault injectors.
pub struct Harness {
    pub orchestrator: SagaOrchestrator,
    pub balances: Arc<FaultyBalanceStore>,
    pub ledger: Arc<FaultyLedgerStore>,
    pub _temp: TempDir,
}

impl Harness {
    pub async fn balance(&self, user: &str, currency: Currency) -> Result<Cents> {
        Ok(self.balances.inner.balance(user, currency).await?)
    }

    /// Seed a balance through a regular deposit.
    pub async fn fund(&self, user: &str, amount: Cents, currency: Currency) -> Result<()> {
        self.orchestrator.deposit(user, amount, currency, "seed").await?;
        Ok(())
    }

    pub async fn transaction_count(&self) -> Result<i64> {
        self.ledger.inner.count_transactions().await
    }

    pub async fn invoice_count(&self) -> Result<i64> {
        self.ledger.inner.count_invoices().await
    }
}

pub async fn harness() -> Result<Harness> {
    harness_with_config(
        SagaConfig::default().with_compensation_backoff(Duration::from_millis(1)),
    )
    .await
}

pub async fn harness_with_config(config: SagaConfig) -> Result<Harness> {
    let temp_dir = TempDir::new()?;
    let ledger_url = format!("sqlite:{}", temp_dir.path().join("ledger.db").display());
    let balance_url = format!("sqlite:{}", temp_dir.path().join("balances.db").display());

    let ledger = Arc::new(FaultyLedgerStore::new(SqliteLedgerStore::init(&ledger_url).await?));
    let balances = Arc::new(FaultyBalanceStore::new(
        SqliteBalanceStore::init(&balance_url).await?,
    ));

    let orchestrator =
        SagaOrchestrator::new(balances.clone(), ledger.clone()).with_config(config);

    Ok(Harness {
        orchestrator,
        balances,
        ledger,
        _temp: temp_dir,
    })
}

/// Plain SQLite stores in a temp dir, for store-level tests.
pub async fn sqlite_stores() -> Result<(SqliteBalanceStore, SqliteLedgerStore, TempDir)> {
    let temp_dir = TempDir::new()?;
    let ledger_url = format!("sqlite:{}", temp_dir.path().join("ledger.db").display());
    let balance_url = format!("sqlite:{}", temp_dir.path().join("balances.db").display());
    Ok((
        SqliteBalanceStore::init(&balance_url).await?,
        SqliteLedgerStore::init(&ledger_url).await?,
        temp_dir,
    ))
}

// ========================
// Ledger fault injection
// ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerFault {
    InsertTransaction,
    InsertInvoice,
    Commit,
    HangCommit,
}

pub struct FaultyLedgerStore {
    pub inner: SqliteLedgerStore,
    fault: Mutex<Option<LedgerFault>>,
    rollbacks: Arc<AtomicUsize>,
    single_lookups: AtomicUsize,
}

impl FaultyLedgerStore {
    pub fn new(inner: SqliteLedgerStore) -> Self {
        Self {
            inner,
            fault: Mutex::new(None),
            rollbacks: Arc::new(AtomicUsize::new(0)),
            single_lookups: AtomicUsize::new(0),
        }
    }

    pub fn inject(&self, fault: Option<LedgerFault>) {
        *self.fault.lock().unwrap() = fault;
    }

    /// Per-transaction reads (`get_transaction`, `get_invoice_for_transaction`).
    pub fn single_lookups(&self) -> usize {
        self.single_lookups.load(Ordering::SeqCst)
    }

    /// Rollbacks issued on scopes that were still open.
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for FaultyLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerScope>> {
        let fault = *self.fault.lock().unwrap();
        Ok(Box::new(FaultyScope {
            inner: self.inner.begin().await?,
            fault,
            rollbacks: self.rollbacks.clone(),
        }))
    }

    async fn get_history(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Transaction>, i64)> {
        self.inner.get_history(user_id, page, limit).await
    }

    async fn get_statement(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<StatementLine>, i64)> {
        self.inner.get_statement(user_id, page, limit).await
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        self.single_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_transaction(id).await
    }

    async fn find_by_reference(&self, reference_id: &str) -> Result<Option<Transaction>> {
        self.inner.find_by_reference(reference_id).await
    }

    async fn get_invoice_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<Invoice>> {
        self.single_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_invoice_for_transaction(transaction_id).await
    }

    async fn list_completed(&self, user_id: &str, currency: Currency) -> Result<Vec<Transaction>> {
        self.inner.list_completed(user_id, currency).await
    }
}

struct FaultyScope {
    inner: Box<dyn LedgerScope>,
    fault: Option<LedgerFault>,
    rollbacks: Arc<AtomicUsize>,
}

#[async_trait]
impl LedgerScope for FaultyScope {
    fn state(&self) -> ScopeState {
        self.inner.state()
    }

    async fn create_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        if self.fault == Some(LedgerFault::InsertTransaction) {
            bail!("injected transaction insert failure");
        }
        self.inner.create_transaction(transaction).await
    }

    async fn create_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        if self.fault == Some(LedgerFault::InsertInvoice) {
            bail!("injected invoice insert failure");
        }
        self.inner.create_invoice(invoice).await
    }

    async fn commit(&mut self) -> Result<()> {
        match self.fault {
            // The inner scope stays open: the caller must roll it back
            Some(LedgerFault::Commit) => bail!("injected commit failure"),
            Some(LedgerFault::HangCommit) => {
                tokio::time::sleep(HANG).await;
                self.inner.commit().await
            }
            _ => self.inner.commit().await,
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.inner.is_finished() {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.rollback().await
    }
}

// ========================
// Balance fault injection
// ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveFault {
    /// Hang before the reservation reaches the store
    HangBefore,
    /// Apply the reservation, then hang before answering
    HangAfter,
}

pub struct FaultyBalanceStore {
    pub inner: SqliteBalanceStore,
    fail_increment: AtomicBool,
    release_failures: AtomicU32,
    reserve_fault: Mutex<Option<ReserveFault>>,
    releases: AtomicUsize,
}

impl FaultyBalanceStore {
    pub fn new(inner: SqliteBalanceStore) -> Self {
        Self {
            inner,
            fail_increment: AtomicBool::new(false),
            release_failures: AtomicU32::new(0),
            reserve_fault: Mutex::new(None),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn fail_increments(&self, fail: bool) {
        self.fail_increment.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` release calls fail.
    pub fn fail_next_releases(&self, count: u32) {
        self.release_failures.store(count, Ordering::SeqCst);
    }

    pub fn inject_reserve(&self, fault: Option<ReserveFault>) {
        *self.reserve_fault.lock().unwrap() = fault;
    }

    /// Release calls that reached the store.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceStore for FaultyBalanceStore {
    async fn increment_balance(
        &self,
        user_id: &str,
        currency: Currency,
        amount: Cents,
        dedup_key: &str,
    ) -> Result<bool> {
        if self.fail_increment.load(Ordering::SeqCst) {
            bail!("injected balance store outage");
        }
        self.inner
            .increment_balance(user_id, currency, amount, dedup_key)
            .await
    }

    async fn decrement_balance_if_sufficient(
        &self,
        user_id: &str,
        currency: Currency,
        amount: Cents,
        reservation_key: &str,
    ) -> Result<bool> {
        let fault = *self.reserve_fault.lock().unwrap();
        match fault {
            Some(ReserveFault::HangBefore) => {
                tokio::time::sleep(HANG).await;
                bail!("unreachable: reservation should have timed out")
            }
            Some(ReserveFault::HangAfter) => {
                self.inner
                    .decrement_balance_if_sufficient(user_id, currency, amount, reservation_key)
                    .await?;
                tokio::time::sleep(HANG).await;
                bail!("unreachable: reservation should have timed out")
            }
            None => {
                self.inner
                    .decrement_balance_if_sufficient(user_id, currency, amount, reservation_key)
                    .await
            }
        }
    }

    async fn release_reservation(&self, reservation_key: &str) -> Result<bool> {
        let failures = self.release_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.release_failures.store(failures - 1, Ordering::SeqCst);
            bail!("injected release failure");
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release_reservation(reservation_key).await
    }

    async fn balance(&self, user_id: &str, currency: Currency) -> Result<Cents> {
        self.inner.balance(user_id, currency).await
    }
}
