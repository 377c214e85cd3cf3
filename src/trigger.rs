//! Defines a _trigger_, the input for the handling of a single
//! object-created notification. The trigger is built from the
//! CloudEvent delivered by Eventarc.

use anyhow::{anyhow, Context, Result};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::instrument;

/// Content type of CloudEvents sent in structured mode.
const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

/// The storage object fields needed from the event payload.
#[derive(Debug, Deserialize)]
struct StorageObjectData {
    bucket: String,
    name: String,
}

/// A CloudEvent sent in structured mode, with its attributes in the
/// body alongside the data.
#[derive(Debug, Deserialize)]
struct StructuredEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    data: StorageObjectData,
}

/// The input to the load handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    /// The full resource name of the object, e.g.
    /// `projects/_/buckets/b1/objects/file.csv`. May be empty.
    pub resource_name: String,
    pub bucket: String,
    pub name: String,
}

impl Trigger {
    /// Builds a trigger from a CloudEvent received over HTTP, in
    /// either binary or structured mode. Headers stay out of the span,
    /// as they carry the push authorization token.
    #[instrument(skip(headers, body))]
    pub fn from_cloud_event(headers: &HeaderMap, body: &[u8]) -> Result<Self> {
        let structured = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with(STRUCTURED_CONTENT_TYPE))
            .unwrap_or(false);
        if structured {
            let event: StructuredEvent =
                serde_json::from_slice(body).context("Invalid structured CloudEvent body")?;
            return Ok(Trigger {
                resource_name: resource_name(event.source.as_deref(), event.subject.as_deref()),
                event_id: event.id,
                timestamp: event.time.unwrap_or_else(Utc::now),
                event_type: event.event_type,
                bucket: event.data.bucket,
                name: event.data.name,
            });
        }

        let header = |name: &str| -> Result<Option<String>> {
            headers
                .get(name)
                .map(|v| {
                    v.to_str()
                        .map(String::from)
                        .with_context(|| format!("Header {} is not valid text", name))
                })
                .transpose()
        };
        let event_id = header("ce-id")?.ok_or_else(|| anyhow!("Missing ce-id header"))?;
        let event_type = header("ce-type")?.ok_or_else(|| anyhow!("Missing ce-type header"))?;
        let timestamp = match header("ce-time")? {
            Some(time) => DateTime::parse_from_rfc3339(&time)
                .with_context(|| format!("Header ce-time {:?} is not an RFC 3339 time", time))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };
        let source = header("ce-source")?;
        let subject = header("ce-subject")?;
        let data: StorageObjectData =
            serde_json::from_slice(body).context("Invalid storage object event body")?;
        Ok(Trigger {
            event_id,
            timestamp,
            event_type,
            resource_name: resource_name(source.as_deref(), subject.as_deref()),
            bucket: data.bucket,
            name: data.name,
        })
    }

    /// Builds a trigger for an object named by hand rather than by a
    /// storage event.
    pub fn manual(bucket: String, name: String) -> Self {
        let timestamp = Utc::now();
        Trigger {
            event_id: format!("manual-{}", timestamp.timestamp_millis()),
            timestamp,
            event_type: String::from("manual"),
            resource_name: format!("projects/_/buckets/{}/objects/{}", bucket, name),
            bucket,
            name,
        }
    }

    /// The table name derived from the object name: everything
    /// before the first dot, with spaces replaced by underscores.
    pub fn table_name(&self) -> String {
        self.name
            .split('.')
            .next()
            .unwrap_or_default()
            .replace(' ', "_")
    }

    /// The URI of the object to be loaded.
    pub fn source_uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.name)
    }
}

/// Join the event source, stripped of its service authority, with
/// the event subject. `//storage.googleapis.com/projects/_/buckets/b`
/// and `objects/f.csv` give `projects/_/buckets/b/objects/f.csv`.
fn resource_name(source: Option<&str>, subject: Option<&str>) -> String {
    let Some(source) = source else {
        return String::new();
    };
    let path = match source.strip_prefix("//") {
        Some(rest) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => source,
    };
    match subject {
        Some(subject) if !subject.is_empty() => format!("{}/{}", path, subject),
        _ => String::from(path),
    }
}
