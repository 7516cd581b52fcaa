use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::sse::Event;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::research::event::PhaseEvent;

/// One frame on the wire. Status events keep their own frame shape;
/// Source and Content share the kind-tagged data shape. `Done` and
/// `Error` terminate the stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Phase(PhaseEvent),
    Done,
    Error(String),
}

impl StreamFrame {
    /// Serialize this frame as a JSON wire value.
    pub fn to_frame(&self) -> serde_json::Value {
        match self {
            StreamFrame::Phase(PhaseEvent::Status { label, detail }) => serde_json::json!({
                "event": "status",
                "data": { "label": label, "detail": detail },
            }),
            StreamFrame::Phase(event) => serde_json::json!({
                "event": "data",
                "data": event,
            }),
            StreamFrame::Done => serde_json::json!({ "event": "done" }),
            StreamFrame::Error(message) => serde_json::json!({
                "event": "error",
                "data": message,
            }),
        }
    }

    fn to_sse_event(&self) -> Event {
        let frame = self.to_frame();
        let name = frame
            .get("event")
            .and_then(|e| e.as_str())
            .unwrap_or("data")
            .to_string();
        let data = frame
            .get("data")
            .map(|d| d.to_string())
            .unwrap_or_else(|| "{}".into());
        Event::default().event(name).data(data)
    }
}

/// SSE adapter that owns the frame channel and the producing task for the
/// whole lifetime of the response.
///
/// Dropping the stream aborts the producer, so a client that disconnects
/// mid-answer tears down in-flight provider calls on that exit path too,
/// instead of leaving them streaming into a closed channel.
pub struct ScopedEventStream {
    frames: ReceiverStream<StreamFrame>,
    producer: JoinHandle<()>,
}

impl ScopedEventStream {
    pub fn new(rx: mpsc::Receiver<StreamFrame>, producer: JoinHandle<()>) -> Self {
        Self {
            frames: ReceiverStream::new(rx),
            producer,
        }
    }
}

impl Stream for ScopedEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames)
            .poll_next(cx)
            .map(|frame| frame.map(|frame| Ok(frame.to_sse_event())))
    }
}

impl Drop for ScopedEventStream {
    fn drop(&mut self) {
        // No-op if the producer already finished.
        self.producer.abort();
    }
}
