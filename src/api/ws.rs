//! WebSocket observers and command channel
//!
//! Every socket is registered with the broadcaster under the category in its
//! path. Sockets in the `player` category may also send transport commands
//! and get a direct `response` message back.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{error_response, AppState, OBSERVER_BACKLOG};
use crate::bus::{
    BusMessage, Category, ChannelConnection, Connection, ConnectionId, SharedBroadcaster,
};
use crate::player::{PlayerCommand, PlayerError};

/// Unregisters an observer's connection when dropped, however its handler exits
pub(super) struct RegistrationGuard {
    broadcaster: SharedBroadcaster,
    id: ConnectionId,
    category: Category,
}

impl RegistrationGuard {
    pub(super) fn register(
        broadcaster: &SharedBroadcaster,
        connection: Arc<dyn Connection>,
        category: Category,
    ) -> Self {
        Self {
            broadcaster: broadcaster.clone(),
            id: broadcaster.register(connection, category),
            category,
        }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.id, self.category);
    }
}

/// GET /ws/{category}
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(category): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Some(category) = Category::parse(&category) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Unknown category: {}", category),
        );
    };
    ws.on_upgrade(move |socket| handle_socket(socket, category, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, category: Category, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound) = ChannelConnection::new(OBSERVER_BACKLOG);
    let guard = RegistrationGuard::register(&state.broadcaster, Arc::new(connection), category);
    info!(connection = guard.id, %category, "Observer connected");

    // Current status right away, before any tick
    if send_json(&mut sender, &state.player.status_message())
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(&state, category, text.as_str()).await;
                        if send_json(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                },
                message = outbound.recv() => {
                    // None: evicted by the broadcaster
                    let Some(message) = message else {
                        debug!(connection = guard.id, "Observer evicted");
                        break;
                    };
                    if send_json(&mut sender, &message).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!(connection = guard.id, %category, "Observer disconnected");
    drop(guard);

    if category == Category::Player {
        release_player(&state).await;
    }
}

async fn handle_command(state: &AppState, category: Category, text: &str) -> BusMessage {
    if category != Category::Player {
        return BusMessage::response(
            false,
            format!("{} connections do not accept commands", category),
        );
    }
    let command = match serde_json::from_str::<PlayerCommand>(text) {
        Ok(command) => command,
        Err(e) => return BusMessage::response(false, format!("Invalid command: {}", e)),
    };
    let name = command.name();
    match state.player.execute(command).await {
        Ok(status) => BusMessage::response(true, format!("{}: {}", name, status.state)),
        Err(e) => BusMessage::response(false, e.to_string()),
    }
}

/// Stop playback when the last player connection is gone
async fn release_player(state: &AppState) {
    if !state.stop_on_disconnect || state.broadcaster.connection_count(Category::Player) > 0 {
        return;
    }
    match state.player.stop().await {
        Ok(_) => info!("Last player connection closed, playback stopped"),
        Err(PlayerError::NotPlaying | PlayerError::ControllerUnavailable) => {}
        Err(e) => warn!("Failed to stop playback after disconnect: {}", e),
    }
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &BusMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("Failed to serialize bus message: {}", e);
            Ok(())
        }
    }
}
