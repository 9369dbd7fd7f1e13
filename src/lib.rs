pub mod application;
pub mod cli;
pub mod domain;
pub mod io;
pub mod storage;

pub use application::{PaymentRequest, SagaConfig, SagaOrchestrator, WalletError};
pub use domain::*;
pub use storage::{BalanceStore, LedgerScope, LedgerStore, SqliteBalanceStore, SqliteLedgerStore};
