//! Defines the audit record kept for every handled event, and the
//! best-effort sink that persists it.

use crate::trigger::Trigger;
use crate::warehouse::{TableRef, Warehouse};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use tracing::{error, info, instrument};

/// The outcome of a handling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Pending,
    Success,
    Failure,
}

/// One row of the audit table. Serializes to the audit table's
/// column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub resource_name: String,
    pub bucket_name: String,
    pub file_name: String,
    pub status: Status,
    pub error_message: Option<String>,
}

impl AuditRecord {
    /// Start the record for a trigger that hasn't been handled yet.
    pub fn pending(trigger: &Trigger) -> Self {
        AuditRecord {
            event_id: trigger.event_id.clone(),
            timestamp: trigger.timestamp,
            event_type: trigger.event_type.clone(),
            resource_name: trigger.resource_name.clone(),
            bucket_name: trigger.bucket.clone(),
            file_name: trigger.name.clone(),
            status: Status::Pending,
            error_message: None,
        }
    }

    pub fn succeed(&mut self) {
        self.status = Status::Success;
        self.error_message = None;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = Status::Failure;
        self.error_message = Some(message.into());
    }
}

/// Append the record to the audit table. Failures are logged and
/// never returned, so that they can't mask the outcome being
/// audited.
#[instrument(skip(warehouse, record), fields(event_id = %record.event_id, status = ?record.status))]
pub async fn log_event<W: Warehouse>(warehouse: &W, table: &TableRef, record: &AuditRecord) {
    let row = match serde_json::to_value(record) {
        Ok(row) => row,
        Err(e) => {
            error!("Failed to serialize event metadata: {:?}", e);
            return;
        }
    };
    match warehouse.insert_rows(table, &[row]).await {
        Ok(errors) if errors.is_empty() => info!("Logged event metadata into {}", table),
        Ok(errors) => error!(
            "Failed to log event metadata: {}",
            errors.iter().join("; ")
        ),
        Err(e) => error!("Failed to log event metadata: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeWarehouse, InsertOutcome};
    use chrono::TimeZone;

    fn record() -> AuditRecord {
        AuditRecord::pending(&Trigger {
            event_id: String::from("e1"),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            event_type: String::from("google.cloud.storage.object.v1.finalized"),
            resource_name: String::new(),
            bucket: String::from("b1"),
            name: String::from("orders 2024.csv"),
        })
    }

    #[test]
    fn serializes_to_audit_columns() {
        let mut record = record();
        record.succeed();
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            serde_json::json!({
                "event_id": "e1",
                "timestamp": "2024-03-01T12:30:00Z",
                "event_type": "google.cloud.storage.object.v1.finalized",
                "resource_name": "",
                "bucket_name": "b1",
                "file_name": "orders 2024.csv",
                "status": "Success",
                "error_message": null
            })
        );
    }

    #[test]
    fn failure_keeps_message() {
        let mut record = record();
        assert_eq!(record.status, Status::Pending);
        record.fail("access denied");
        assert_eq!(record.status, Status::Failure);
        assert_eq!(record.error_message.as_deref(), Some("access denied"));
    }

    #[tokio::test]
    async fn inserts_one_row() {
        let warehouse = FakeWarehouse::default();
        let table = TableRef::new("p", "d", "event_audit");
        log_event(&warehouse, &table, &record()).await;
        let inserts = warehouse.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].0, table);
        assert_eq!(inserts[0].1.len(), 1);
        assert_eq!(inserts[0].1[0]["status"], "Pending");
    }

    #[tokio::test]
    async fn swallows_row_errors() {
        let warehouse = FakeWarehouse::default().with_insert(InsertOutcome::RowErrors);
        log_event(&warehouse, &TableRef::new("p", "d", "a"), &record()).await;
        assert_eq!(warehouse.inserts().len(), 1);
    }

    #[tokio::test]
    async fn swallows_insert_faults() {
        let warehouse = FakeWarehouse::default().with_insert(InsertOutcome::Fault);
        log_event(&warehouse, &TableRef::new("p", "d", "a"), &record()).await;
        assert_eq!(warehouse.inserts().len(), 1);
    }
}
