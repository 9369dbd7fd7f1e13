mod common;

use std::time::Duration;

use anyhow::Result;
use common::{LedgerFault, ReserveFault, harness, harness_with_config};
use saldo::application::{SagaConfig, WalletError};
use saldo::domain::Currency;
use saldo::storage::BalanceStore;

fn fast_deadline() -> SagaConfig {
    SagaConfig::default()
        .with_step_timeout(Duration::from_millis(200))
        .with_compensation_backoff(Duration::from_millis(1))
}

#[tokio::test]
async fn test_commit_failure_restores_balance() -> Result<()> {
    let h = harness().await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.ledger.inject(Some(LedgerFault::Commit));

    let err = h
        .orchestrator
        .withdraw("alice", 2000, Currency::Chf, "iban")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::LedgerWriteFailure(_)), "got {:?}", err);
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);
    // Only the seed deposit persisted
    assert_eq!(h.transaction_count().await?, 1);
    assert_eq!(h.invoice_count().await?, 1);
    assert_eq!(h.ledger.rollbacks(), 1);
    assert_eq!(h.balances.releases(), 1);
    Ok(())
}

#[tokio::test]
async fn test_invoice_insert_failure_rolls_back_transaction() -> Result<()> {
    let h = harness().await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.ledger.inject(Some(LedgerFault::InsertInvoice));

    let err = h
        .orchestrator
        .withdraw("alice", 500, Currency::Chf, "iban")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::LedgerWriteFailure(_)));
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);
    assert_eq!(h.transaction_count().await?, 1);
    assert_eq!(h.ledger.rollbacks(), 1);
    Ok(())
}

#[tokio::test]
async fn test_transaction_insert_failure_compensates() -> Result<()> {
    let h = harness().await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.ledger.inject(Some(LedgerFault::InsertTransaction));

    let err = h
        .orchestrator
        .withdraw("alice", 2000, Currency::Chf, "iban")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::LedgerWriteFailure(_)));
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);

    // The store is healthy again: funds were not lost
    h.ledger.inject(None);
    h.orchestrator.withdraw("alice", 2000, Currency::Chf, "iban").await?;
    assert_eq!(h.balance("alice", Currency::Chf).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_timed_out_commit_is_a_ledger_failure() -> Result<()> {
    let h = harness_with_config(fast_deadline()).await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.ledger.inject(Some(LedgerFault::HangCommit));

    let err = h
        .orchestrator
        .withdraw("alice", 1500, Currency::Chf, "iban")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::LedgerWriteFailure(_)));
    assert!(err.to_string().contains("timed out"));
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);
    assert_eq!(h.transaction_count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_refund_is_retried_until_it_succeeds() -> Result<()> {
    let h = harness().await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.ledger.inject(Some(LedgerFault::Commit));
    h.balances.fail_next_releases(2);

    let err = h
        .orchestrator
        .withdraw("alice", 2000, Currency::Chf, "iban")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::LedgerWriteFailure(_)));
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_refund_is_escalated() -> Result<()> {
    let h = harness().await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.ledger.inject(Some(LedgerFault::Commit));
    h.balances.fail_next_releases(10);

    let err = h
        .orchestrator
        .withdraw("alice", 2000, Currency::Chf, "iban")
        .await
        .unwrap_err();

    let WalletError::CompensationFailed { reservation_key, .. } = &err else {
        panic!("expected CompensationFailed, got {:?}", err);
    };
    assert!(reservation_key.starts_with("withdraw:"));
    // Funds stay reserved until an operator releases them
    assert_eq!(h.balance("alice", Currency::Chf).await?, 0);

    h.balances.fail_next_releases(0);
    assert!(h.balances.inner.release_reservation(reservation_key).await?);
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);
    Ok(())
}

#[tokio::test]
async fn test_reservation_timeout_before_apply() -> Result<()> {
    let h = harness_with_config(fast_deadline()).await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.balances.inject_reserve(Some(ReserveFault::HangBefore));

    let err = h
        .orchestrator
        .withdraw("alice", 500, Currency::Chf, "iban")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::BalanceUnavailable(_)), "got {:?}", err);
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);
    assert_eq!(h.transaction_count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_reservation_timeout_after_apply_is_released() -> Result<()> {
    let h = harness_with_config(fast_deadline()).await?;
    h.fund("alice", 2000, Currency::Chf).await?;
    h.balances.inject_reserve(Some(ReserveFault::HangAfter));

    let err = h
        .orchestrator
        .withdraw("alice", 500, Currency::Chf, "iban")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::BalanceUnavailable(_)));
    assert_eq!(h.balance("alice", Currency::Chf).await?, 2000);
    Ok(())
}

#[tokio::test]
async fn test_deposit_ledger_failure_mutates_nothing() -> Result<()> {
    let h = harness().await?;
    h.ledger.inject(Some(LedgerFault::Commit));

    let err = h
        .orchestrator
        .deposit("alice", 10000, Currency::Chf, "card")
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::LedgerWriteFailure(_)));
    assert_eq!(h.balance("alice", Currency::Chf).await?, 0);
    assert_eq!(h.transaction_count().await?, 0);
    assert_eq!(h.invoice_count().await?, 0);
    assert_eq!(h.ledger.rollbacks(), 1);
    Ok(())
}
