// @awa-component: BUS-StreamEndpoint
//
//! `GET /stream`: Server-Sent Events for one subscriber.
//!
//! Headers are committed with the first poll, so nothing after that point can
//! turn into an error envelope: a frame that fails to encode is logged and
//! ends the stream.

use std::convert::Infallible;

use axum::extract::{Extension, State};
use axum::http::header::{CACHE_CONTROL, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use marquee_core::bus::{BusEvent, ConnectionMeta, SubscriberKey};
use tracing::{debug, error};

use crate::AppState;
use crate::middleware::auth::AuthenticatedUser;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Text of the keep-alive comment frame.
pub const KEEP_ALIVE_TEXT: &str = "keep-alive";

pub async fn stream_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
) -> Response {
    let key = SubscriberKey::for_caller(&caller);
    debug!(key = %key, user_id = %caller.user_id, "stream requested");
    let subscription = state.bus.subscribe(key, ConnectionMeta::from(&caller));

    let frames = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        match frame(&event) {
            Ok(frame) => Some((Ok::<_, Infallible>(frame), subscription)),
            Err(e) => {
                error!(key = %subscription.key(), "could not encode stream frame, closing: {e}");
                None
            }
        }
    });

    let sse = Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(state.config.sse_keep_alive)
            .text(KEEP_ALIVE_TEXT),
    );
    (
        [(CACHE_CONTROL, "no-cache"), (X_ACCEL_BUFFERING, "no")],
        sse,
    )
        .into_response()
}

fn frame(event: &BusEvent) -> Result<Event, axum::Error> {
    Event::default().json_data(event)
}
