//! Defines the global BigQuery client, speaking the BigQuery v2 REST
//! API.

use crate::warehouse::{Job, JobReference, LoadOptions, RowError, TableRef, Warehouse};
use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// The production BigQuery endpoint.
const DEFAULT_ENDPOINT_URL: &str = "https://bigquery.googleapis.com";

/// Where access tokens for the attached service account are issued,
/// on Cloud Run, Cloud Functions and Compute Engine.
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-account/default/token";

/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Upper bound for any single API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    /// Whether the token can still be used at `now`, keeping
    /// `TOKEN_EXPIRY_MARGIN` clear of its expiry.
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// How requests are authorized.
enum Credentials {
    /// A fixed bearer token.
    Static(String),
    /// Tokens fetched from the metadata server, cached until shortly
    /// before they expire.
    MetadataServer {
        token_url: String,
        cache: Mutex<Option<CachedToken>>,
    },
    /// No authorization, for emulators.
    Anonymous,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<RowError>,
}

/// A BigQuery client. Cheap to share: it holds a connection pool and
/// the current access token.
pub struct BigQuery {
    http: reqwest::Client,
    endpoint_url: String,
    location: Option<String>,
    credentials: Credentials,
}

impl BigQuery {
    fn new(
        endpoint_url: String,
        location: Option<String>,
        credentials: Credentials,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build the HTTP client")?;
        Ok(BigQuery {
            http,
            endpoint_url,
            location,
            credentials,
        })
    }

    /// Get a bearer token for the next request, if requests are
    /// authorized at all.
    async fn token(&self) -> Result<Option<String>> {
        match &self.credentials {
            Credentials::Static(token) => Ok(Some(token.clone())),
            Credentials::Anonymous => Ok(None),
            Credentials::MetadataServer { token_url, cache } => {
                let mut cached = cache.lock().await;
                if let Some(token) = cached.as_ref() {
                    if token.is_fresh(Instant::now()) {
                        return Ok(Some(token.value.clone()));
                    }
                }
                debug!("Fetching access token from the metadata server");
                let response = self
                    .http
                    .get(token_url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .context("Failed to reach the metadata server for an access token")?;
                let response: TokenResponse = check_response("Metadata server", response)
                    .await?
                    .json()
                    .await
                    .context("Invalid access token response from the metadata server")?;
                let value = response.access_token;
                *cached = Some(CachedToken {
                    value: value.clone(),
                    expires_at: Instant::now() + Duration::from_secs(response.expires_in),
                });
                Ok(Some(value))
            }
        }
    }

    /// Send a request, authorized, and decode its JSON response.
    async fn send<T>(&self, request: reqwest::RequestBuilder) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let request = match self.token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        Ok(check_response("BigQuery API", response)
            .await?
            .json()
            .await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/bigquery/v2/{}", self.endpoint_url, path)
    }
}

impl Warehouse for BigQuery {
    #[instrument(skip(self, options))]
    async fn submit_load(
        &self,
        source_uri: &str,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> Result<Job> {
        let body = load_job_body(source_uri, destination, options, self.location.as_deref());
        let url = self.url(&format!("projects/{}/jobs", destination.project_id));
        self.send(self.http.post(url).json(&body)).await
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job: &JobReference) -> Result<Job> {
        let url = self.url(&format!("projects/{}/jobs/{}", job.project_id, job.job_id));
        let mut request = self.http.get(url);
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }
        self.send(request).await
    }

    #[instrument(skip(self, rows))]
    async fn insert_rows(&self, table: &TableRef, rows: &[Value]) -> Result<Vec<RowError>> {
        let url = self.url(&format!(
            "projects/{}/datasets/{}/tables/{}/insertAll",
            table.project_id, table.dataset_id, table.table_id
        ));
        let body = json!({
            "rows": rows.iter().map(|row| json!({"json": row})).collect::<Vec<Value>>()
        });
        let response: InsertAllResponse = self.send(self.http.post(url).json(&body)).await?;
        Ok(response.insert_errors)
    }
}

/// Build the `jobs.insert` body for a CSV load job.
fn load_job_body(
    source_uri: &str,
    destination: &TableRef,
    options: &LoadOptions,
    location: Option<&str>,
) -> Value {
    let mut reference = json!({"projectId": destination.project_id});
    if let Some(location) = location {
        reference["location"] = json!(location);
    }
    json!({
        "jobReference": reference,
        "configuration": {
            "load": {
                "sourceUris": [source_uri],
                "sourceFormat": "CSV",
                "destinationTable": destination,
                "skipLeadingRows": options.skip_leading_rows,
                "autodetect": options.autodetect,
                "fieldDelimiter": options.field_delimiter,
                "allowQuotedNewlines": options.allow_quoted_newlines,
                "quote": options.quote_character,
                "writeDisposition": options.write_disposition,
            }
        }
    })
}

/// Turn non-success responses into errors naming the `service` that
/// answered and carrying its own error message.
async fn check_response(service: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "{} error ({}): {}",
            service,
            status.as_u16(),
            api_message(&body)
        ));
    }
    Ok(response)
}

/// Extract `error.message` from a Google API error body, or fall back
/// to the raw body.
fn api_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| String::from(body.trim()))
}

/// Add a scheme to an endpoint given as a bare host, and drop any
/// trailing slash.
fn normalize_endpoint_url(endpoint_url: &str) -> String {
    let url = if endpoint_url.starts_with("http://") || endpoint_url.starts_with("https://") {
        String::from(endpoint_url)
    } else {
        format!("https://{}", endpoint_url)
    };
    String::from(url.trim_end_matches('/'))
}

/// Global BigQuery client instance.
static CURRENT: OnceCell<BigQuery> = OnceCell::new();

/// Initialize the global BigQuery client. Honors
/// `BIGQUERY_ENDPOINT_URL` and `BIGQUERY_ACCESS_TOKEN`; otherwise
/// tokens are taken from the metadata server.
pub fn init(location: Option<String>) -> Result<()> {
    let endpoint_url_var = env::var("BIGQUERY_ENDPOINT_URL");
    let token_var = env::var("BIGQUERY_ACCESS_TOKEN");
    let client = if let Ok(endpoint_url) = endpoint_url_var {
        BigQuery::new(
            normalize_endpoint_url(&endpoint_url),
            location,
            match token_var {
                Ok(token) => Credentials::Static(token),
                // should be OK since the endpoint was overridden
                Err(_) => Credentials::Anonymous,
            },
        )
    } else {
        BigQuery::new(
            String::from(DEFAULT_ENDPOINT_URL),
            location,
            match token_var {
                Ok(token) => Credentials::Static(token),
                Err(_) => Credentials::MetadataServer {
                    token_url: String::from(METADATA_TOKEN_URL),
                    cache: Mutex::new(None),
                },
            },
        )
    }?;
    CURRENT
        .set(client)
        .map_err(|_| anyhow!("client::CURRENT was already initialized"))
}

/// Get the current BigQuery client instance, or panic if it hasn't
/// been initialized.
pub fn current() -> &'static BigQuery {
    CURRENT.get().expect("client is not initialized")
}
