//! In-memory warehouse used by unit tests. Records every call and
//! answers with scripted outcomes.

use crate::warehouse::{
    ErrorProto, Job, JobReference, JobStatus, LoadOptions, RowError, TableRef, Warehouse,
};
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Build a job in the given state, reporting the given
/// `(reason, message)` errors.
pub fn job(state: &str, errors: &[(&str, &str)]) -> Job {
    Job {
        job_reference: JobReference {
            project_id: String::from("p"),
            job_id: String::from("job_fake"),
            location: Some(String::from("US")),
        },
        status: JobStatus {
            state: String::from(state),
            error_result: None,
            errors: errors
                .iter()
                .map(|(reason, message)| ErrorProto {
                    reason: Some(String::from(*reason)),
                    location: None,
                    message: Some(String::from(*message)),
                })
                .collect(),
        },
        statistics: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    RowErrors,
    Fault,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Submit {
        source_uri: String,
        destination: TableRef,
        options: LoadOptions,
    },
    GetJob(String),
    Insert {
        table: TableRef,
        rows: Vec<serde_json::Value>,
    },
}

pub struct FakeWarehouse {
    submit: Result<Job, String>,
    polls: Mutex<VecDeque<Result<Job, String>>>,
    insert: InsertOutcome,
    calls: Mutex<Vec<Call>>,
}

impl Default for FakeWarehouse {
    /// A warehouse whose load jobs finish on submission without
    /// errors, and whose inserts succeed.
    fn default() -> Self {
        FakeWarehouse {
            submit: Ok(job("DONE", &[])),
            polls: Mutex::new(VecDeque::new()),
            insert: InsertOutcome::Inserted,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeWarehouse {
    pub fn with_submit(mut self, outcome: Result<Job, &str>) -> Self {
        self.submit = outcome.map_err(String::from);
        self
    }

    /// Queue the answers to successive job lookups. Once exhausted,
    /// lookups report a running job.
    pub fn with_polls(self, polls: Vec<Result<Job, &str>>) -> Self {
        *self.polls.lock().unwrap() = polls
            .into_iter()
            .map(|p| p.map_err(String::from))
            .collect();
        self
    }

    pub fn with_insert(mut self, outcome: InsertOutcome) -> Self {
        self.insert = outcome;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn inserts(&self) -> Vec<(TableRef, Vec<serde_json::Value>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Insert { table, rows } => Some((table, rows)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Warehouse for FakeWarehouse {
    async fn submit_load(
        &self,
        source_uri: &str,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> Result<Job> {
        self.record(Call::Submit {
            source_uri: String::from(source_uri),
            destination: destination.clone(),
            options: options.clone(),
        });
        self.submit.clone().map_err(|e| anyhow!(e))
    }

    async fn get_job(&self, job_reference: &JobReference) -> Result<Job> {
        self.record(Call::GetJob(job_reference.job_id.clone()));
        let next = self.polls.lock().unwrap().pop_front();
        match next {
            Some(poll) => poll.map_err(|e| anyhow!(e)),
            None => Ok(job("RUNNING", &[])),
        }
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[serde_json::Value],
    ) -> Result<Vec<RowError>> {
        self.record(Call::Insert {
            table: table.clone(),
            rows: rows.to_vec(),
        });
        match self.insert {
            InsertOutcome::Inserted => Ok(Vec::new()),
            InsertOutcome::RowErrors => Ok(vec![RowError {
                index: 0,
                errors: vec![ErrorProto {
                    reason: Some(String::from("invalid")),
                    location: Some(String::from("status")),
                    message: Some(String::from("no such field")),
                }],
            }]),
            InsertOutcome::Fault => Err(anyhow!("connection reset")),
        }
    }
}
