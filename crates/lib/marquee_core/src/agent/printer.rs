//! Receipt printer sinks.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::AgentError;
use crate::models::agent::PrintJob;

/// Where print jobs end up.
#[async_trait]
pub trait PrintSink: Send + Sync {
    async fn print(&self, job: &PrintJob) -> Result<(), AgentError>;
}

/// Logs each receipt.
#[derive(Debug, Default)]
pub struct LogPrinter;

#[async_trait]
impl PrintSink for LogPrinter {
    async fn print(&self, job: &PrintJob) -> Result<(), AgentError> {
        info!(
            tenant_id = %job.tenant_id,
            order_id = %job.order_id,
            order_number = job.order_number,
            items = job.items.len(),
            total_cents = job.pricing.total_cents,
            seat = job.customer.seat.as_deref().unwrap_or("-"),
            "print job"
        );
        Ok(())
    }
}

/// Appends each job as one JSON line to a spool file picked up by the
/// printer driver.
#[derive(Debug, Clone)]
pub struct FilePrinter {
    path: PathBuf,
}

impl FilePrinter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PrintSink for FilePrinter {
    async fn print(&self, job: &PrintJob) -> Result<(), AgentError> {
        let mut line =
            serde_json::to_vec(job).map_err(|e| AgentError::Print(format!("encode job: {e}")))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AgentError::Print(format!("open {}: {e}", self.path.display())))?;
        file.write_all(&line)
            .await
            .map_err(|e| AgentError::Print(format!("write {}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| AgentError::Print(format!("flush {}: {e}", self.path.display())))?;
        Ok(())
    }
}

/// Keeps printed jobs in memory.
#[derive(Debug, Default)]
pub struct MemoryPrinter {
    jobs: Mutex<Vec<PrintJob>>,
}

impl MemoryPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<PrintJob> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PrintSink for MemoryPrinter {
    async fn print(&self, job: &PrintJob) -> Result<(), AgentError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| AgentError::Print("printer state poisoned".into()))?;
        jobs.push(job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::id::{OrderId, TenantId};
    use crate::models::order::{CustomerInfo, OrderItem, Pricing};

    fn job(number: i64) -> PrintJob {
        let items = vec![OrderItem {
            product_id: Some("P1".into()),
            name: "Nachos".into(),
            quantity: 1,
            unit_price_cents: 650,
        }];
        PrintJob {
            order_id: OrderId::new(format!("O{number}")),
            tenant_id: TenantId::new("T1"),
            order_number: number,
            pricing: Pricing::compute(&items, 50),
            items,
            customer: CustomerInfo {
                seat: Some("H12".into()),
                ..CustomerInfo::default()
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_printer_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let printer = FilePrinter::new(dir.path().join("spool.jsonl"));
        printer.print(&job(1)).await.unwrap();
        printer.print(&job(2)).await.unwrap();

        let text = std::fs::read_to_string(printer.path()).unwrap();
        let numbers: Vec<i64> = text
            .lines()
            .map(|l| serde_json::from_str::<PrintJob>(l).unwrap().order_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn file_printer_reports_unwritable_spool() {
        let dir = tempfile::tempdir().unwrap();
        let printer = FilePrinter::new(dir.path().join("missing").join("spool.jsonl"));
        assert!(matches!(
            printer.print(&job(1)).await,
            Err(AgentError::Print(_))
        ));
    }

    #[tokio::test]
    async fn memory_printer_records_jobs() {
        let printer = MemoryPrinter::new();
        printer.print(&job(7)).await.unwrap();
        assert_eq!(printer.jobs()[0].order_number, 7);
    }
}
