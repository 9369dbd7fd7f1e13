use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use crate::application::{PaymentRequest, SagaConfig, SagaOrchestrator};
use crate::domain::{Currency, Transaction, format_cents, parse_cents};

/// Saldo - balance and invoice ledger kept consistent by a saga
#[derive(Parser)]
#[command(name = "saldo")]
#[command(about = "Deposits, withdrawals and invoice history across a balance store and a ledger")]
#[command(version)]
pub struct Cli {
    /// Ledger database file (transactions + invoices)
    #[arg(long, env = "SALDO_LEDGER_DB", default_value = "saldo-ledger.db")]
    pub ledger_db: String,

    /// Balance-of-record database file
    #[arg(long, env = "SALDO_BALANCE_DB", default_value = "saldo-balances.db")]
    pub balance_db: String,

    /// Deadline for each individual store call, in milliseconds
    #[arg(long, env = "SALDO_STEP_TIMEOUT_MS", default_value_t = 5000)]
    pub step_timeout_ms: u64,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create both databases
    Init,

    /// Credit funds to a user
    Deposit {
        /// User id
        user: String,

        /// Amount (e.g., "50.00" or "50")
        amount: String,

        /// Currency: CHF, EUR, USD, GBP
        #[arg(short, long, value_parser = parse_currency, default_value = "CHF")]
        currency: Currency,

        /// Payment method (e.g., "card", "bank_transfer")
        #[arg(short, long, default_value = "manual")]
        method: String,

        /// Idempotency reference; repeating it returns the original transaction
        #[arg(long)]
        reference: Option<String>,

        /// Description of the deposit
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Debit funds from a user
    Withdraw {
        /// User id
        user: String,

        /// Amount (e.g., "50.00" or "50")
        amount: String,

        /// Currency: CHF, EUR, USD, GBP
        #[arg(short, long, value_parser = parse_currency, default_value = "CHF")]
        currency: Currency,

        /// Payout method (e.g., "iban")
        #[arg(short, long, default_value = "manual")]
        method: String,

        /// Idempotency reference; repeating it returns the original transaction
        #[arg(long)]
        reference: Option<String>,

        /// Description of the withdrawal
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Show a user's balance (all currencies if none given)
    Balance {
        user: String,

        #[arg(short, long, value_parser = parse_currency)]
        currency: Option<Currency>,
    },

    /// List a user's transactions, newest first
    History {
        user: String,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show a transaction and its invoice
    Show {
        /// Transaction ID (UUID)
        id: String,
    },

    /// Re-apply the balance credit of a committed deposit
    Resync {
        /// Transaction ID (UUID)
        id: String,
    },

    /// Compare a user's balance with the ledger, crediting missing deposits
    Reconcile {
        user: String,

        #[arg(short, long, value_parser = parse_currency, default_value = "CHF")]
        currency: Currency,
    },

    /// Export a user's history as CSV
    Export {
        user: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

fn parse_currency(s: &str) -> std::result::Result<Currency, String> {
    Currency::from_str(s)
        .ok_or_else(|| format!("unknown currency '{}' (expected CHF, EUR, USD, GBP)", s))
}

/// Install the global tracing subscriber. RUST_LOG wins over `--verbose`.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

impl Cli {
    async fn orchestrator(&self) -> Result<SagaOrchestrator> {
        let config =
            SagaConfig::default().with_step_timeout(Duration::from_millis(self.step_timeout_ms));
        let orchestrator = SagaOrchestrator::init(&self.ledger_db, &self.balance_db)
            .await
            .context("Failed to open databases")?;
        Ok(orchestrator.with_config(config))
    }

    pub async fn run(self) -> Result<()> {
        init_tracing(self.verbose);
        let orchestrator = self.orchestrator().await?;

        match self.command {
            Commands::Init => {
                println!("Ledger database:  {}", self.ledger_db);
                println!("Balance database: {}", self.balance_db);
            }

            Commands::Deposit {
                user,
                amount,
                currency,
                method,
                reference,
                description,
            } => {
                let request = build_request(user, &amount, currency, method, reference, description)?;
                let transaction = orchestrator.execute_deposit(request).await?;
                print_recorded("Deposited", &transaction);
            }

            Commands::Withdraw {
                user,
                amount,
                currency,
                method,
                reference,
                description,
            } => {
                let request = build_request(user, &amount, currency, method, reference, description)?;
                let transaction = orchestrator.execute_withdraw(request).await?;
                print_recorded("Withdrew", &transaction);
            }

            Commands::Balance { user, currency } => {
                let currencies = match currency {
                    Some(c) => vec![c],
                    None => Currency::ALL.to_vec(),
                };
                println!("{:<8} {:>14}", "CURRENCY", "BALANCE");
                println!("{}", "-".repeat(23));
                for currency in currencies {
                    let balance = orchestrator.balance(&user, currency).await?;
                    println!("{:<8} {:>14}", currency, format_cents(balance));
                }
            }

            Commands::History { user, page, limit } => {
                let history = orchestrator.get_history(&user, page, limit).await?;
                if history.transactions.is_empty() {
                    println!("No transactions found.");
                } else {
                    println!(
                        "{:<36} {:<20} {:<11} {:>12} {:<4}",
                        "ID", "DATE", "TYPE", "AMOUNT", "CUR"
                    );
                    println!("{}", "-".repeat(87));
                    for t in &history.transactions {
                        println!(
                            "{:<36} {:<20} {:<11} {:>12} {:<4}",
                            t.id,
                            t.created_at.format("%Y-%m-%d %H:%M:%S"),
                            t.transaction_type,
                            format_cents(t.amount),
                            t.currency
                        );
                    }
                }
                println!(
                    "\nPage {} of {} ({} transactions)",
                    history.page, history.total_pages, history.total
                );
            }

            Commands::Show { id } => {
                let id = parse_id(&id)?;
                let info = orchestrator.get_transaction(id).await?;
                let t = &info.transaction;
                println!("Transaction: {}", t.id);
                println!("  User:         {}", t.user_id);
                println!("  Type:         {}", t.transaction_type);
                println!("  Status:       {}", t.status);
                println!("  Amount:       {} {}", format_cents(t.amount), t.currency);
                println!("  Reference:    {}", t.reference_id);
                println!("  Created:      {}", t.created_at.format("%Y-%m-%d %H:%M:%S"));
                if let Some(desc) = &t.description {
                    println!("  Description:  {}", desc);
                }
                for (key, value) in &t.metadata {
                    println!("  {:<13} {}", format!("{}:", key), value);
                }
                match &info.invoice {
                    Some(invoice) => {
                        println!();
                        println!("Invoice: {}", invoice.invoice_number);
                        println!("  Amount:       {} {}", format_cents(invoice.amount), invoice.currency);
                        println!("  Issued:       {}", invoice.issued_at.format("%Y-%m-%d %H:%M:%S"));
                    }
                    None => println!("\nNo invoice"),
                }
            }

            Commands::Resync { id } => {
                let id = parse_id(&id)?;
                if orchestrator.resync_deposit(id).await? {
                    println!("Applied missing balance credit for {}", id);
                } else {
                    println!("Balance already in sync for {}", id);
                }
            }

            Commands::Reconcile { user, currency } => {
                let report = orchestrator.reconcile(&user, currency).await?;
                println!("Reconciliation for {} ({})", report.user_id, report.currency);
                println!("  Balance:        {}", format_cents(report.balance));
                println!("  Ledger total:   {}", format_cents(report.ledger_total));
                println!("  Resynced:       {}", report.resynced);
                if report.is_consistent() {
                    println!("\n✓ Balance and ledger agree");
                } else {
                    match report.difference() {
                        Some(diff) => println!("\n✗ Difference: {}", format_cents(diff)),
                        None => println!("\n✗ Difference out of range"),
                    }
                }
            }

            Commands::Export { user, output } => {
                run_export_command(&orchestrator, &user, output.as_deref()).await?;
            }
        }

        Ok(())
    }
}

fn build_request(
    user: String,
    amount: &str,
    currency: Currency,
    method: String,
    reference: Option<String>,
    description: Option<String>,
) -> Result<PaymentRequest> {
    let amount_cents =
        parse_cents(amount).context("Invalid amount format. Use '50.00' or '50'")?;
    let mut request = PaymentRequest::new(user, amount_cents, currency, method);
    if let Some(reference) = reference {
        request = request.with_reference(reference);
    }
    if let Some(description) = description {
        request = request.with_description(description);
    }
    Ok(request)
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).context("Invalid transaction ID format (expected UUID)")
}

fn print_recorded(verb: &str, transaction: &Transaction) {
    println!(
        "{} {} {} for {} ({})",
        verb,
        format_cents(transaction.amount.abs()),
        transaction.currency,
        transaction.user_id,
        transaction.id
    );
}

async fn run_export_command(
    orchestrator: &SagaOrchestrator,
    user: &str,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{Write, stdout};

    let exporter = Exporter::new(orchestrator);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    let count = exporter.export_history_csv(user, writer).await?;
    if output.is_some() {
        eprintln!("Exported {} transactions", count);
    }
    Ok(())
}
