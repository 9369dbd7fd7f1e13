use anyhow::Result;
use std::io::Write;

use crate::application::SagaOrchestrator;
use crate::domain::format_cents;

/// Exports a user's ledger history for audits.
pub struct Exporter<'a> {
    orchestrator: &'a SagaOrchestrator,
}

impl<'a> Exporter<'a> {
    pub fn new(orchestrator: &'a SagaOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Write every transaction of `user_id` as CSV, newest first, each with
    /// its invoice number. Returns the number of rows written.
    pub async fn export_history_csv<W: Write>(&self, user_id: &str, writer: W) -> Result<usize> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "created_at",
            "type",
            "status",
            "amount",
            "currency",
            "reference_id",
            "method",
            "description",
            "invoice_number",
        ])?;

        let limit = self.orchestrator.config().max_page_size;
        let mut page = 1;
        let mut count = 0;
        loop {
            let statement = self.orchestrator.get_statement(user_id, page, limit).await?;
            for line in statement.lines {
                let transaction = line.transaction;
                csv_writer.write_record([
                    transaction.id.to_string(),
                    transaction.created_at.to_rfc3339(),
                    transaction.transaction_type.to_string(),
                    transaction.status.to_string(),
                    format_cents(transaction.amount),
                    transaction.currency.to_string(),
                    transaction.reference_id,
                    transaction.metadata.get("method").cloned().unwrap_or_default(),
                    transaction.description.unwrap_or_default(),
                    line.invoice_number.unwrap_or_default(),
                ])?;
                count += 1;
            }

            if page >= statement.total_pages {
                break;
            }
            page += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }
}
