use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::TransactionId;

pub type SagaId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaKind {
    Deposit,
    Withdraw,
}

impl SagaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaKind::Deposit => "deposit",
            SagaKind::Withdraw => "withdraw",
        }
    }
}

/// Progress of a saga across the balance store and the ledger.
///
/// ```text
/// deposit:   Init -> LedgerCommitted -> BalanceSynced
/// withdraw:  Init -> FundsReserved -> LedgerCommitted -> BalanceSynced
///                               \-> Compensated
/// any non-terminal state may also end in Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    Init,
    FundsReserved,
    LedgerCommitted,
    BalanceSynced,
    Compensated,
    Failed,
}

impl SagaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Init => "INIT",
            SagaState::FundsReserved => "FUNDS_RESERVED",
            SagaState::LedgerCommitted => "LEDGER_COMMITTED",
            SagaState::BalanceSynced => "BALANCE_SYNCED",
            SagaState::Compensated => "COMPENSATED",
            SagaState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::BalanceSynced | SagaState::Compensated | SagaState::Failed
        )
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal {kind:?} saga transition {from} -> {to}")]
pub struct SagaTransitionError {
    pub kind: SagaKind,
    pub from: SagaState,
    pub to: SagaState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaTransition {
    pub from: SagaState,
    pub to: SagaState,
    pub at: DateTime<Utc>,
}

/// One execution of a deposit or withdraw saga, with its transition journal.
#[derive(Debug, Clone)]
pub struct Saga {
    pub id: SagaId,
    pub kind: SagaKind,
    state: SagaState,
    journal: Vec<SagaTransition>,
}

impl Saga {
    pub fn new(kind: SagaKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: SagaState::Init,
            journal: Vec::new(),
        }
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn journal(&self) -> &[SagaTransition] {
        &self.journal
    }

    /// Whether `kind` may move from `from` to `to`.
    pub fn can_transition(kind: SagaKind, from: SagaState, to: SagaState) -> bool {
        use SagaState::*;
        match (kind, from, to) {
            (SagaKind::Deposit, Init, LedgerCommitted) => true,
            (SagaKind::Withdraw, Init, FundsReserved) => true,
            (SagaKind::Withdraw, FundsReserved, LedgerCommitted) => true,
            (SagaKind::Withdraw, FundsReserved, Compensated) => true,
            (_, LedgerCommitted, BalanceSynced) => true,
            (_, from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Move to `to`, recording the transition.
    pub fn advance(&mut self, to: SagaState) -> Result<(), SagaTransitionError> {
        if !Self::can_transition(self.kind, self.state, to) {
            return Err(SagaTransitionError {
                kind: self.kind,
                from: self.state,
                to,
            });
        }
        self.journal.push(SagaTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        tracing::debug!(saga_id = %self.id, kind = self.kind.as_str(), from = %self.state, to = %to, "saga transition");
        self.state = to;
        Ok(())
    }

    /// True while reserved funds must be either committed or released.
    pub fn owes_compensation(&self) -> bool {
        self.state == SagaState::FundsReserved
    }

    /// Key under which a withdraw saga reserves funds.
    pub fn reservation_key(&self) -> String {
        format!("withdraw:{}", self.id)
    }
}

/// Dedup key for the balance credit of a committed deposit. Derived from the
/// transaction id so any retry or sweep credits at most once.
pub fn deposit_credit_key(transaction_id: TransactionId) -> String {
    format!("deposit:{}", transaction_id)
}
