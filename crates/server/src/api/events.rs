use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use common::TrackEvent;
use futures_util::stream::{Stream, StreamExt};
use library::EventSink;
use tracing::{debug, warn};

use crate::state::{AppState, HealthResponse, QueuesResponse};

/// GET /events: live lifecycle notifications as server-sent events.
pub async fn subscribe(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Event subscriber connected");
    let closing = state.shutdown.clone().cancelled_owned();
    let stream = state.events.subscribe().take_until(closing).filter_map(|event| async move {
        match Event::default().event(event.action.as_str()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(err) => {
                warn!("Failed to encode event: {}", err);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// POST /events: entry point for workers running in another process.
pub async fn publish(
    State(state): State<AppState>,
    Json(event): Json<TrackEvent>,
) -> (StatusCode, Json<HealthResponse>) {
    state.events.publish(event);
    (StatusCode::ACCEPTED, Json(HealthResponse { status: "ok" }))
}

pub async fn queues(State(state): State<AppState>) -> Json<QueuesResponse> {
    Json(QueuesResponse {
        queues: state.pipeline.queue_depths(),
        workers: state.pool_stats(),
        subscribers: state.events.subscriber_count(),
    })
}
