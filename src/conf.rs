//! Defines configuration as read from the environment.

use serde::Deserialize;

/// Default `table_prefix` value.
fn default_table_prefix() -> String {
    String::from("100_")
}

/// Default `load_job_timeout_secs` value.
fn default_load_job_timeout_secs() -> u64 {
    600
}

/// Default `load_job_poll_interval_ms` value.
fn default_load_job_poll_interval_ms() -> u64 {
    1000
}

/// The loader is configured to load newly created objects into
/// BigQuery tables, and to audit each attempt into a fixed table. The
/// configuration must be given as environment variables.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// The project holding both the destination tables and the audit
    /// table.
    pub project_id: String,

    /// The dataset holding both the destination tables and the audit
    /// table.
    pub dataset_id: String,

    /// The table receiving one row per handled event.
    pub audit_table_id: String,

    /// The literal prepended to every table name derived from an
    /// object name.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Defines a filter to select only matching object names. The
    /// star (*) can be used as a wildcard matching any number of
    /// non-slash characters. E.g. to match any CSV file in a folder,
    /// use `"folder/*.csv"`. Omitting this will make it match any
    /// object.
    #[serde(default)]
    pub match_key: Option<String>,

    /// The maximum amount of seconds to wait for a load job to reach
    /// a terminal state.
    #[serde(default = "default_load_job_timeout_secs")]
    pub load_job_timeout_secs: u64,

    /// The amount of milliseconds between successive load job status
    /// checks.
    #[serde(default = "default_load_job_poll_interval_ms")]
    pub load_job_poll_interval_ms: u64,

    /// The location in which load jobs are run and looked up. If
    /// omitted, BigQuery picks it from the destination dataset.
    #[serde(default)]
    pub bigquery_location: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reads_required_variables_and_defaults() {
        let settings: Settings = envy::from_iter(vars(&[
            ("PROJECT_ID", "p"),
            ("DATASET_ID", "d"),
            ("AUDIT_TABLE_ID", "event_audit"),
        ]))
        .unwrap();
        assert_eq!(settings.project_id, "p");
        assert_eq!(settings.dataset_id, "d");
        assert_eq!(settings.audit_table_id, "event_audit");
        assert_eq!(settings.table_prefix, "100_");
        assert_eq!(settings.match_key, None);
        assert_eq!(settings.load_job_timeout_secs, 600);
        assert_eq!(settings.load_job_poll_interval_ms, 1000);
        assert_eq!(settings.bigquery_location, None);
    }

    #[test]
    fn overrides_defaults() {
        let settings: Settings = envy::from_iter(vars(&[
            ("PROJECT_ID", "p"),
            ("DATASET_ID", "d"),
            ("AUDIT_TABLE_ID", "a"),
            ("TABLE_PREFIX", "raw_"),
            ("MATCH_KEY", "incoming/*.csv"),
            ("LOAD_JOB_TIMEOUT_SECS", "30"),
            ("LOAD_JOB_POLL_INTERVAL_MS", "250"),
            ("BIGQUERY_LOCATION", "EU"),
        ]))
        .unwrap();
        assert_eq!(settings.table_prefix, "raw_");
        assert_eq!(settings.match_key.as_deref(), Some("incoming/*.csv"));
        assert_eq!(settings.load_job_timeout_secs, 30);
        assert_eq!(settings.load_job_poll_interval_ms, 250);
        assert_eq!(settings.bigquery_location.as_deref(), Some("EU"));
    }

    #[test]
    fn missing_audit_table_fails() {
        let result: Result<Settings, _> =
            envy::from_iter(vars(&[("PROJECT_ID", "p"), ("DATASET_ID", "d")]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("audit_table_id"), "{}", err);
    }

    #[test]
    fn non_numeric_timeout_fails() {
        let result: Result<Settings, _> = envy::from_iter(vars(&[
            ("PROJECT_ID", "p"),
            ("DATASET_ID", "d"),
            ("AUDIT_TABLE_ID", "a"),
            ("LOAD_JOB_TIMEOUT_SECS", "soon"),
        ]));
        assert!(result.is_err());
    }
}
