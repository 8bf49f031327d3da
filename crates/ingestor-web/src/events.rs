//! Server-Sent Events stream of task notifications

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use openem_ingestor::TaskEvent;
use serde::Deserialize;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Only forward events of this task
    pub transfer_id: Option<Uuid>,
}

/// Forward every notifier event as one SSE message named after the event
pub async fn events_handler(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!(transfer_id = ?filter.transfer_id, "event stream opened");
    let stream = BroadcastStream::new(state.subscribe_events()).filter_map(move |received| {
        let event = match received {
            Ok(event) => event,
            Err(lagged) => {
                tracing::warn!(error = %lagged, "event subscriber lagged behind");
                return None;
            }
        };
        if filter.transfer_id.is_some_and(|id| id != event.transfer_id()) {
            return None;
        }
        to_sse(&event).map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &TaskEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode task event");
            None
        }
    }
}
