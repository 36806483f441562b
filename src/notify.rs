//! Delivery of progress events to whoever is waiting on a request.
//!
//! A [`Notifier`] is fire-and-forget: it never blocks the pipeline, and a requester that went
//! away simply stops receiving events.

use futures_core::Stream;
use futures_util::{StreamExt, pin_mut};
use tokio::sync::mpsc;

use crate::processing::{ProgressEvent, RequestId};

/// Sink for progress events.
pub trait Notifier: Send + Sync {
    /// Forward one event. Must not block.
    fn notify(&self, request_id: RequestId, event: &ProgressEvent);
}

/// Writes every event to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, request_id: RequestId, event: &ProgressEvent) {
        tracing::info!(
            request_id = %request_id,
            ordinal = event.ordinal,
            stage = event.stage.name(),
            "{}",
            event.label
        );
    }
}

/// Forwards events into an unbounded channel read by the transport layer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolve once the receiving side has been dropped.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, request_id: RequestId, event: &ProgressEvent) {
        if self.sender.send(event.clone()).is_err() {
            tracing::debug!(
                request_id = %request_id,
                ordinal = event.ordinal,
                "Requester gone; dropping progress event"
            );
        }
    }
}

/// Drain a request's event stream into `notifier`, returning the terminal event.
///
/// Returns `None` only when the stream ended without a terminal stage.
pub async fn deliver<S>(events: S, notifier: &dyn Notifier) -> Option<ProgressEvent>
where
    S: Stream<Item = ProgressEvent>,
{
    pin_mut!(events);
    let mut last = None;
    while let Some(event) = events.next().await {
        notifier.notify(event.request_id, &event);
        last = Some(event);
    }
    last.filter(|event| event.stage.is_terminal())
}
