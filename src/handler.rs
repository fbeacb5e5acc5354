//! WebSocket connection handler
//!
//! Handles individual client connections: registration with the hub,
//! inbound message decoding and dispatch, and outbound frame writing.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::connection::Frame;
use crate::error::AppError;
use crate::hub::HubHandle;
use crate::message::{ActionMessage, ClientMessage, StateUpdate};
use crate::types::ConnectionId;

/// Per-type handlers for inbound client messages
///
/// Handlers run on the connection's own read task: a slow handler delays
/// only that connection's further reads.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_state_update(&self, connection_id: ConnectionId, update: StateUpdate);

    async fn on_action(&self, connection_id: ConnectionId, action: ActionMessage);

    async fn on_refresh_request(&self, connection_id: ConnectionId);

    async fn on_heartbeat_ack(&self, connection_id: ConnectionId, client_time: u64, server_time: u64);

    async fn on_event(&self, connection_id: ConnectionId, name: String, data: Value);

    /// A frame that is not a valid client message
    async fn on_decode_error(&self, connection_id: ConnectionId, error: AppError) {
        warn!("Dropped frame from {}: {}", connection_id, error);
    }
}

/// Route a decoded message to its handler
pub async fn dispatch<H>(handler: &H, connection_id: ConnectionId, msg: ClientMessage)
where
    H: MessageHandler + ?Sized,
{
    match msg {
        ClientMessage::StateUpdate(update) => handler.on_state_update(connection_id, update).await,
        ClientMessage::Action(action) => handler.on_action(connection_id, action).await,
        ClientMessage::StateRefreshRequest => handler.on_refresh_request(connection_id).await,
        ClientMessage::HeartbeatAck {
            client_time,
            server_time,
        } => {
            handler
                .on_heartbeat_ack(connection_id, client_time, server_time)
                .await
        }
        ClientMessage::Event { name, data } => handler.on_event(connection_id, name, data).await,
    }
}

/// Handle a raw TCP connection
///
/// Performs the WebSocket handshake, then serves the socket.
pub async fn accept_tcp<H>(stream: TcpStream, hub: HubHandle, handler: Arc<H>) -> Result<(), AppError>
where
    H: MessageHandler,
{
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    serve_socket(ws_stream, hub, handler).await
}

/// Serve an already upgraded WebSocket
///
/// Registers the connection with the hub, runs the read and write tasks and
/// removes the connection from the hub when either ends.
pub async fn serve_socket<S, H>(
    ws_stream: WebSocketStream<S>,
    hub: HubHandle,
    handler: Arc<H>,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: MessageHandler,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Generate connection ID
    let connection_id = ConnectionId::new();

    // Channel for hub -> socket frames
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(hub.connection_buffer());

    // Register with the hub
    if let Err(e) = hub.accept(connection_id, frame_tx).await {
        error!("Failed to register connection {}: {}", connection_id, e);
        return Err(e);
    }

    info!("Connection {} open", connection_id);

    // Spawn read task (WebSocket -> MessageHandler)
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        debug!("{} from {}", client_msg.kind(), connection_id);
                        dispatch(handler.as_ref(), connection_id, client_msg).await;
                    }
                    Err(e) => {
                        handler
                            .on_decode_error(connection_id, AppError::Decode(e))
                            .await;
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong replies are handled by tungstenite
                }
                Ok(_) => {
                    // Binary and raw frames are not part of the protocol
                }
                Err(e) => {
                    warn!("WebSocket error for {}: {}", connection_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", connection_id);
    });

    // Spawn write task (Frame -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_sender.send(Message::text(&*frame)).await.is_err() {
                debug!("WebSocket send failed, ending write task");
                break;
            }
        }

        // Hub dropped the connection or the socket failed
        let _ = ws_sender.close().await;
        debug!("Write task ended for {}", connection_id);
    });

    tokio::select! {
        _ = &mut read_task => {
            // The write task drains and closes once the hub drops the sender.
            debug!("Read task completed for {}", connection_id);
        }
        _ = &mut write_task => {
            read_task.abort();
            debug!("Write task completed for {}", connection_id);
        }
    }

    let _ = hub.remove(connection_id).await;

    info!("Connection {} closed", connection_id);

    Ok(())
}
