//! `/events`: piece completion over a websocket

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tidegate_core::events::{Event, EventSink, run_event_loop};
use tidegate_core::streaming;

use crate::error::ApiResult;
use crate::handlers::request::TorrentRequest;

/// `GET /events?ih=<hex>`
///
/// Waits for the info before upgrading, then sends one
/// `{"pieceChanged": <index>}` text message per completion change.
pub async fn events(request: TorrentRequest, upgrade: WebSocketUpgrade) -> ApiResult<Response> {
    streaming::wait_for_info(request.torrent.as_ref(), request.cancel_token()).await?;
    Ok(upgrade.on_upgrade(move |socket| stream_events(socket, request)))
}

async fn stream_events(socket: WebSocket, request: TorrentRequest) {
    let (sender, receiver) = socket.split();
    let mut sink = WebSocketSink(sender);
    let exit = run_event_loop(
        request.torrent.subscribe_piece_changes(),
        &mut sink,
        client_closed(receiver),
        request.cancel_token(),
    )
    .await;
    tracing::debug!("Events for {} stopped: {:?}", request.info_hash(), exit);
    if let Err(e) = sink.0.close().await {
        tracing::debug!("Closing events socket failed: {}", e);
    }
}

/// Resolves once the client closes or its side of the socket fails.
async fn client_closed(mut receiver: SplitStream<WebSocket>) {
    while let Some(Ok(message)) = receiver.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

struct WebSocketSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl EventSink for WebSocketSink {
    type Error = axum::Error;

    async fn send_event(&mut self, event: &Event) -> Result<(), Self::Error> {
        match event.to_json() {
            Ok(json) => self.0.send(Message::Text(json.into())).await,
            Err(e) => {
                tracing::warn!("Skipping event {:?}: {}", event, e);
                Ok(())
            }
        }
    }
}
