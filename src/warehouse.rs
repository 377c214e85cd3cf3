//! Defines the warehouse operations the loader depends on, and the
//! BigQuery resources exchanged through them.

use anyhow::Result;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// A fully qualified table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(project_id: &str, dataset_id: &str, table_id: &str) -> Self {
        TableRef {
            project_id: String::from(project_id),
            dataset_id: String::from(dataset_id),
            table_id: String::from(table_id),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Whether a load job replaces or extends the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteDisposition {
    #[serde(rename = "WRITE_TRUNCATE")]
    Overwrite,
    #[serde(rename = "WRITE_APPEND")]
    Append,
}

/// Options for a CSV load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub skip_leading_rows: u32,
    pub autodetect: bool,
    pub field_delimiter: String,
    pub allow_quoted_newlines: bool,
    pub quote_character: String,
    pub write_disposition: WriteDisposition,
}

impl Default for LoadOptions {
    /// Header row skipped, schema inferred, and the destination's
    /// previous contents replaced.
    fn default() -> Self {
        LoadOptions {
            skip_leading_rows: 1,
            autodetect: true,
            field_delimiter: String::from(","),
            allow_quoted_newlines: true,
            quote_character: String::from("\""),
            write_disposition: WriteDisposition::Overwrite,
        }
    }
}

/// An error reported by BigQuery, either for a job or for a row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ErrorProto {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl fmt::Display for ErrorProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.reason.as_deref().unwrap_or("error"),
            self.message.as_deref().unwrap_or("(no message)")
        )?;
        if let Some(location) = &self.location {
            write!(f, " (at {})", location)?;
        }
        Ok(())
    }
}

/// Identifies a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: String,
    #[serde(default)]
    pub error_result: Option<ErrorProto>,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStatistics {
    /// Serialized by BigQuery as a decimal string.
    #[serde(default)]
    pub output_rows: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct JobStatistics {
    #[serde(default)]
    pub load: Option<LoadStatistics>,
}

/// The state of a job as reported by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_reference: JobReference,
    pub status: JobStatus,
    #[serde(default)]
    pub statistics: Option<JobStatistics>,
}

impl Job {
    /// Whether the job reached its terminal state.
    pub fn is_done(&self) -> bool {
        self.status.state == "DONE"
    }

    /// The string form of the errors reported by the job, if any.
    /// The job-level error result is usually repeated inside the
    /// error list, so it's only used on its own when the list is
    /// empty.
    pub fn failure(&self) -> Option<String> {
        if !self.status.errors.is_empty() {
            Some(self.status.errors.iter().join("; "))
        } else {
            self.status.error_result.as_ref().map(|e| e.to_string())
        }
    }

    /// The amount of rows written by a load job.
    pub fn output_rows(&self) -> Option<u64> {
        self.statistics
            .as_ref()
            .and_then(|s| s.load.as_ref())
            .and_then(|l| l.output_rows.as_ref())
            .and_then(|rows| rows.parse().ok())
    }
}

/// The errors reported for a single inserted row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RowError {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.index, self.errors.iter().join("; "))
    }
}

/// The warehouse operations needed to load an object and audit the
/// attempt.
pub trait Warehouse {
    /// Submit a load job ingesting `source_uri` into `destination`.
    fn submit_load(
        &self,
        source_uri: &str,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> impl Future<Output = Result<Job>> + Send;

    /// Fetch the current state of a job.
    fn get_job(&self, job: &JobReference) -> impl Future<Output = Result<Job>> + Send;

    /// Append rows to a table, returning the errors of rows that
    /// couldn't be inserted.
    fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[serde_json::Value],
    ) -> impl Future<Output = Result<Vec<RowError>>> + Send;
}
