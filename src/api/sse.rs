//! Progress channel -> server-sent events.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use tokio::sync::mpsc;

use crate::events::ProgressEvent;

/// The stream ends when every sender is dropped, i.e. when the operation
/// feeding it has finished.
pub fn from_channel(
    rx: mpsc::Receiver<ProgressEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::unfold(rx, |mut rx| async move {
        let ev = rx.recv().await?;
        let frame = Event::default().event(ev.event).data(ev.data.to_string());
        Some((Ok(frame), rx))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
