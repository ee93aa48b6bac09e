//! Request handlers

use std::convert::Infallible;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::SetupRequest;
use crate::inference::{QueryStream, StreamEvent};
use crate::server::{error::ServerError, state::AppState};

/// Body of a query call
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub prompt: String,
}

/// Configures the session: loads the model and resolves the parameters.
pub async fn handle_setup(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<Value>, ServerError> {
    let summary = state.engine.setup(request).await?;
    tracing::info!(
        "Session ready on {}: {} prompt tokens, n_keep = {}, interactive = {}",
        summary.model,
        summary.prompt_tokens,
        summary.n_keep,
        summary.interactive
    );

    Ok(Json(json!({ "instance_id": summary.instance_id })))
}

/// Runs a query and streams its output as server-sent events.
///
/// Rejections (busy, unconfigured, oversized input) are plain HTTP errors;
/// failures after the stream opened arrive as a final `error` event.
pub async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, ServerError> {
    let stream = state.engine.query(request.prompt).await?;
    tracing::debug!("Streaming query {}", stream.id);
    Ok(stream_events(stream).into_response())
}

pub async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "configured": state.engine.is_configured(),
    }))
}

/// The stream owns the [`QueryStream`]; a client disconnect drops it, which
/// cancels generation on the worker.
fn stream_events(mut query: QueryStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = async_stream::stream! {
        while let Some(event) = query.recv().await {
            yield Ok(to_sse(&event));
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_sse(event: &StreamEvent) -> Event {
    let name = match event {
        StreamEvent::Token(_) => "token",
        StreamEvent::Error(_) => "error",
        _ => "control",
    };

    Event::default()
        .event(name)
        .data(json!({ "message": event.message() }).to_string())
}
