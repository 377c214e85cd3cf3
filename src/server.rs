//! Defines the HTTP surface: storage events arrive as CloudEvents
//! posted by Eventarc.

use crate::app::App;
use crate::trigger::Trigger;
use crate::warehouse::Warehouse;
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tracing::{info, warn};

/// The handles shared by every request. Both live for the whole
/// process.
pub struct ServerState<W: 'static> {
    pub app: &'static App,
    pub warehouse: &'static W,
}

impl<W: 'static> Clone for ServerState<W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<W: 'static> Copy for ServerState<W> {}

/// Build the router serving storage events and liveness checks.
pub fn router<W>(app: &'static App, warehouse: &'static W) -> Router
where
    W: Warehouse + Send + Sync + 'static,
{
    Router::new()
        .route("/", post(function_handler::<W>))
        .route("/healthz", get(healthz))
        .with_state(ServerState { app, warehouse })
}

/// Handle a storage event delivered as a CloudEvent. Job errors are
/// recorded in the audit table and acknowledged; faults are answered
/// with a server error so that the event is delivered again.
async fn function_handler<W>(
    State(state): State<ServerState<W>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)>
where
    W: Warehouse + Send + Sync + 'static,
{
    let trigger = Trigger::from_cloud_event(&headers, &body).map_err(|e| {
        warn!("Couldn't decode the storage event: {:#}", e);
        (StatusCode::BAD_REQUEST, format!("{:#}", e))
    })?;
    if !state.app.matches(&trigger) {
        info!(
            "Skipping object {:?}, which doesn't match the key filter",
            trigger.name
        );
        return Ok(StatusCode::NO_CONTENT);
    }
    state
        .app
        .handle(&trigger, state.warehouse)
        .await
        .with_context(|| format!("Failed to handle event {:?}", trigger.event_id))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
