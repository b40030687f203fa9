//! Live piece completion feed.
//!
//! [`run_event_loop`] forwards a torrent's piece changes to one client until
//! the client goes away, the request is cancelled, or the torrent stops
//! publishing. It adds no buffering of its own: a client that cannot keep up
//! stalls the loop, and the subscription skips what it missed.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::PieceSubscription;

/// Event sent to clients. Serialized externally tagged in camelCase, so
/// `PieceChanged(3)` becomes `{"pieceChanged":3}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    PieceChanged(u32),
}

impl Event {
    /// JSON text of the event.
    ///
    /// # Errors
    /// - `serde_json::Error` - Serialization failed
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Destination of one client's events.
#[async_trait]
pub trait EventSink: Send {
    type Error: std::fmt::Display + Send;

    async fn send_event(&mut self, event: &Event) -> Result<(), Self::Error>;
}

#[async_trait]
impl EventSink for mpsc::Sender<Event> {
    type Error = mpsc::error::SendError<Event>;

    async fn send_event(&mut self, event: &Event) -> Result<(), Self::Error> {
        self.send(*event).await
    }
}

/// Why an event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Client closed its side of the connection
    ClientClosed,
    /// Request was cancelled
    Cancelled,
    /// Torrent stopped publishing changes
    SubscriptionClosed,
    /// Sending to the client failed
    SendFailed,
}

/// Forwards piece changes to `sink` until one of the stop conditions fires.
///
/// Changes are sent in the order the subscription yields them, duplicates
/// included. The subscription is closed on every exit path.
pub async fn run_event_loop<S, C>(
    mut subscription: PieceSubscription,
    sink: &mut S,
    client_closed: C,
    cancel: &CancellationToken,
) -> LoopExit
where
    S: EventSink,
    C: Future<Output = ()> + Send,
{
    tokio::pin!(client_closed);
    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break LoopExit::Cancelled,
            () = &mut client_closed => break LoopExit::ClientClosed,
            change = subscription.recv() => {
                let Some(change) = change else {
                    break LoopExit::SubscriptionClosed;
                };
                let event = Event::PieceChanged(change.index.as_u32());
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break LoopExit::Cancelled,
                    () = &mut client_closed => break LoopExit::ClientClosed,
                    sent = sink.send_event(&event) => {
                        if let Err(e) = sent {
                            tracing::debug!("Event send failed: {}", e);
                            break LoopExit::SendFailed;
                        }
                    }
                }
            }
        }
    };
    subscription.close();
    tracing::debug!("Event loop ended: {:?}", exit);
    exit
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::{broadcast, oneshot};

    use super::*;
    use crate::engine::PieceStateChange;
    use crate::torrent::{InfoHash, PieceIndex};

    fn subscription() -> (broadcast::Sender<PieceStateChange>, PieceSubscription) {
        let (sender, receiver) = broadcast::channel(16);
        (sender, PieceSubscription::new(InfoHash::new([3; 20]), receiver))
    }

    fn change(index: u32) -> PieceStateChange {
        PieceStateChange {
            index: PieceIndex::new(index),
            complete: true,
        }
    }

    #[test]
    fn test_event_json_shape() {
        assert_eq!(
            Event::PieceChanged(7).to_json().unwrap(),
            r#"{"pieceChanged":7}"#
        );
    }

    #[tokio::test]
    async fn test_events_keep_order_and_duplicates() {
        let (publisher, subscription) = subscription();
        for index in [3, 7, 7, 9] {
            publisher.send(change(index)).unwrap();
        }
        drop(publisher);

        let (mut sink, mut received) = mpsc::channel(8);
        let exit = run_event_loop(
            subscription,
            &mut sink,
            std::future::pending(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(exit, LoopExit::SubscriptionClosed);
        let mut events = Vec::new();
        while let Ok(event) = received.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            [3, 7, 7, 9].map(Event::PieceChanged).to_vec()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_close_ends_loop() {
        let (publisher, subscription) = subscription();
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let (mut sink, mut received) = mpsc::channel(8);

        let handle = tokio::spawn(async move {
            run_event_loop(
                subscription,
                &mut sink,
                async {
                    let _ = closed_rx.await;
                },
                &CancellationToken::new(),
            )
            .await
        });

        publisher.send(change(1)).unwrap();
        assert_eq!(received.recv().await, Some(Event::PieceChanged(1)));

        drop(closed_tx);
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, LoopExit::ClientClosed);
        assert_eq!(publisher.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_client_stalled() {
        let (publisher, subscription) = subscription();
        // Capacity one and nobody reading: the second send blocks.
        let (mut sink, _received) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_event_loop(subscription, &mut sink, std::future::pending(), &loop_cancel).await
        });
        publisher.send(change(1)).unwrap();
        publisher.send(change(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_send_failure() {
        let (publisher, subscription) = subscription();
        let (mut sink, received) = mpsc::channel(1);
        drop(received);
        publisher.send(change(4)).unwrap();

        let exit = run_event_loop(
            subscription,
            &mut sink,
            std::future::pending(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, LoopExit::SendFailed);
    }
}
