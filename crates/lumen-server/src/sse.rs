//! Server-Sent-Events streams.
//!
//! Both streams ride the in-process event bus. Subscribers that fall
//! behind lose the oldest events (broadcast lag) and simply converge on
//! the next one; the pending-changes stream additionally opens with a
//! snapshot computed from the database, so a reconnect needs no resume
//! cursor.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;

use lumen_jobs::pending;

use crate::error::ApiResult;
use crate::state::AppState;

/// Comment keepalives every 30 s keep proxies and browsers warm.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

fn sse_headers() -> [(HeaderName, &'static str); 2] {
    // no-cache plus disabled proxy buffering, or events sit in nginx.
    [(header::CACHE_CONTROL, "no-cache"), (X_ACCEL_BUFFERING, "no")]
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(KEEPALIVE_INTERVAL).text("")
}

/// `GET /jobs/stream`: every job lifecycle and item event, as JSON.
pub async fn jobs_stream(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.bus.subscribe_jobs();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => Event::default()
                .json_data(&event)
                .ok()
                .map(Ok::<_, Infallible>),
            // Lagged receiver: intermediate states are gone, later events
            // still converge to the terminal state.
            Err(_) => None,
        }
    });

    (
        sse_headers(),
        Sse::new(stream).keep_alive(keep_alive()),
    )
}

/// `GET /pending-changes`: an initial full snapshot, then a full snapshot
/// per change burst.
pub async fn pending_stream(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let snapshot = pending::compute_snapshot(&state.photos).await?;
    let initial = stream::iter(
        Event::default()
            .json_data(&snapshot)
            .ok()
            .map(Ok::<_, Infallible>),
    );

    let rx = state.bus.subscribe_pending();
    let updates = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(snapshot) => Event::default()
                .json_data(&snapshot)
                .ok()
                .map(Ok::<_, Infallible>),
            Err(_) => None,
        }
    });

    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(initial.chain(updates));
    Ok((
        sse_headers(),
        Sse::new(stream).keep_alive(keep_alive()),
    ))
}
