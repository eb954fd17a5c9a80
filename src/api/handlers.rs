//! Request handlers for the matchmaking API

use crate::error::MatchmakingError;
use crate::pairing::{MatchOutcome, PairingOrchestrator};
use crate::types::{PairingOutcome, UserId};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Header carrying the authenticated caller's id
pub const USER_ID_HEADER: &str = "x-user-id";

/// State shared by every API handler
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<PairingOrchestrator>,
    /// Parent of every request's cancellation token
    pub shutdown: CancellationToken,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Read the caller's id from `X-User-ID`
fn parse_user_id(headers: &HeaderMap) -> Result<UserId, Response> {
    let Some(value) = headers.get(USER_ID_HEADER) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "X-User-ID header is required",
        ));
    };

    value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<UserId>().ok())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "X-User-ID must be an integer"))
}

/// HTTP status for a `find_match` call that failed before any wait began
pub fn status_for(error: &MatchmakingError) -> StatusCode {
    match error {
        MatchmakingError::AlreadyQueued { .. } | MatchmakingError::AlreadyRegistered { .. } => {
            StatusCode::CONFLICT
        }
        MatchmakingError::StoreError { .. } => StatusCode::SERVICE_UNAVAILABLE,
        MatchmakingError::SessionCreationError { .. } | MatchmakingError::PairingFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        MatchmakingError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The single server-sent event that closes a matchmaking stream
pub fn outcome_event(outcome: &PairingOutcome) -> Event {
    match outcome {
        Ok(chat_session_id) => Event::default().event("match").data(chat_session_id),
        Err(MatchmakingError::Timeout) => Event::default()
            .event("timeout")
            .data("no partner found in time"),
        Err(MatchmakingError::Cancelled) => Event::default()
            .event("cancelled")
            .data("matchmaking cancelled"),
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

fn single_event_stream<F>(outcome: F) -> Response
where
    F: std::future::Future<Output = PairingOutcome> + Send + 'static,
{
    let events = stream::once(async move { Ok::<Event, Infallible>(outcome_event(&outcome.await)) });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// `GET /api/matchmaking/start`
///
/// Streams exactly one event: `match` with the chat session id, or
/// `timeout`, `cancelled` or `error`. Closing the connection while waiting
/// cancels the wait.
pub async fn start_matchmaking(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let user_id = match parse_user_id(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    info!("User {} started matchmaking", user_id);

    // Once a partner is popped `find_match` must run to completion, so it
    // gets its own task and survives this handler being dropped.
    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    let search = tokio::spawn(async move { orchestrator.find_match(user_id, cancel).await });

    match search.await {
        Ok(Ok(MatchOutcome::Paired(chat_session_id))) => {
            debug!("User {} paired on arrival", user_id);
            single_event_stream(async move { Ok(chat_session_id) })
        }
        Ok(Ok(MatchOutcome::Pending(pending))) => {
            debug!("User {} waiting for a partner", user_id);
            // Dropping the stream drops `pending`, which cancels the wait
            single_event_stream(pending.wait())
        }
        Ok(Err(e)) => {
            warn!("Matchmaking for user {} rejected: {}", user_id, e);
            error_response(status_for(&e), e.to_string())
        }
        Err(e) => {
            error!("Matchmaking task for user {} failed: {}", user_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "matchmaking task failed")
        }
    }
}
