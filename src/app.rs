//! Defines the read-only application state and the load handler.

use crate::audit::{self, AuditRecord};
use crate::conf::Settings;
use crate::trigger::Trigger;
use crate::warehouse::{Job, LoadOptions, TableRef, Warehouse};
use anyhow::{anyhow, Context, Result};
use envy::from_env;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, warn};

/// An App is an initialized application state, derived from
/// settings. This is only useful to pre-compute stuff that will be
/// used constantly.
#[derive(Debug)]
pub struct App {
    /// The original settings.
    pub settings: Settings,

    /// The table receiving audit records.
    pub audit_table: TableRef,

    /// The regex that matches object names.
    pub match_key_re: Regex,

    /// The options every load job is submitted with.
    pub load_options: LoadOptions,
}

/// Check that `value` is a valid identifier of the given kind.
fn validate(kind: &str, value: &str, pattern: &str) -> Result<()> {
    if Regex::new(pattern)?.is_match(value) {
        Ok(())
    } else {
        Err(anyhow!("Invalid {} {:?}", kind, value))
    }
}

impl App {
    /// Initialize an App instance given a settings struct. Consumes
    /// the settings struct.
    pub fn new(settings: Settings) -> Result<Self> {
        validate("project id", &settings.project_id, r"^[a-z]([a-z0-9.:-]*[a-z0-9])?$")?;
        validate("dataset id", &settings.dataset_id, r"^[A-Za-z0-9_]+$")?;
        validate("audit table id", &settings.audit_table_id, r"^[A-Za-z0-9_]+$")?;
        validate("table prefix", &settings.table_prefix, r"^[A-Za-z0-9_]*$")?;
        if settings.load_job_poll_interval_ms == 0 {
            return Err(anyhow!("Invalid load job poll interval: must be at least 1ms"));
        }
        // Parse regexes
        let match_key_re = if let Some(match_key) = &settings.match_key {
            Regex::new(&format!(
                "^{}$",
                match_key
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<String>>()
                    .join("[^/]*?")
            ))
        } else {
            Regex::new("")
        }?;
        let audit_table = TableRef::new(
            &settings.project_id,
            &settings.dataset_id,
            &settings.audit_table_id,
        );
        // Done
        Ok(App {
            settings,
            audit_table,
            match_key_re,
            load_options: LoadOptions::default(),
        })
    }

    /// Whether the object named in the trigger should be loaded.
    pub fn matches(&self, trigger: &Trigger) -> bool {
        self.match_key_re.is_match(&trigger.name)
    }

    /// The table the object named in the trigger is loaded into.
    pub fn destination(&self, trigger: &Trigger) -> TableRef {
        TableRef::new(
            &self.settings.project_id,
            &self.settings.dataset_id,
            &format!("{}{}", self.settings.table_prefix, trigger.table_name()),
        )
    }

    /// Handle an invocation trigger: load the object into its
    /// destination table, and audit the attempt exactly once. A
    /// load job that completes with errors yields a `Failure` record
    /// but not an error; a fault while submitting or waiting is
    /// returned after the audit row is written.
    #[instrument(
        skip(self, trigger, warehouse),
        fields(event_id = %trigger.event_id, object = %trigger.name)
    )]
    pub async fn handle<W: Warehouse>(
        &self,
        trigger: &Trigger,
        warehouse: &W,
    ) -> Result<AuditRecord> {
        let destination = self.destination(trigger);
        let mut record = AuditRecord::pending(trigger);

        let result = self.load(trigger, &destination, warehouse).await;
        match &result {
            Ok(job) => match job.failure() {
                Some(errors) => {
                    error!("Load job errors: {}", errors);
                    record.fail(errors);
                }
                None => {
                    info!("Successfully loaded {} into {}", trigger.name, destination);
                    record.succeed();
                }
            },
            Err(e) => {
                error!(
                    "Failed to load data from {} to BigQuery: {:#}",
                    trigger.source_uri(),
                    e
                );
                record.fail(format!("{:#}", e));
            }
        }

        audit::log_event(warehouse, &self.audit_table, &record).await;
        result.map(|_| record)
    }

    /// Submit the load job and wait for it to finish.
    async fn load<W: Warehouse>(
        &self,
        trigger: &Trigger,
        destination: &TableRef,
        warehouse: &W,
    ) -> Result<Job> {
        let uri = trigger.source_uri();
        info!("Starting load for {} into BigQuery table {}", uri, destination);
        let job = warehouse
            .submit_load(&uri, destination, &self.load_options)
            .await
            .with_context(|| format!("Failed to submit load job for {:?}", uri))?;
        let job = self.wait_for(job, warehouse).await?;
        info!("Job {} completed", job.job_reference.job_id);
        if let Some(rows) = job.output_rows() {
            info!("Loaded {} rows into {}", rows, destination);
        }
        Ok(job)
    }

    /// Poll a job until it's done, or until the configured timeout
    /// runs out.
    async fn wait_for<W: Warehouse>(&self, job: Job, warehouse: &W) -> Result<Job> {
        let limit = Duration::from_secs(self.settings.load_job_timeout_secs);
        let interval = Duration::from_millis(self.settings.load_job_poll_interval_ms);
        let job_id = job.job_reference.job_id.clone();
        timeout(limit, async {
            let mut job = job;
            while !job.is_done() {
                sleep(interval).await;
                job = warehouse
                    .get_job(&job.job_reference)
                    .await
                    .with_context(|| format!("Failed to check the state of job {}", job_id))?;
            }
            Ok::<_, anyhow::Error>(job)
        })
        .await
        .map_err(|_| {
            warn!("Gave up waiting on job {}", job_id);
            anyhow!("Job {} did not finish within {:?}", job_id, limit)
        })?
    }
}

/// Global App instance.
static CURRENT: OnceCell<App> = OnceCell::new();

/// Initialize the global App instance.
pub fn init() -> Result<()> {
    let settings = from_env().context("Invalid configuration")?;
    let app = App::new(settings)?;
    CURRENT
        .set(app)
        .map_err(|_| anyhow!("app::CURRENT was already initialized"))
}

/// Get the current App instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static App {
    CURRENT.get().expect("app is not initialized")
}
