use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use causeway_proto::{generate_connection_id, ClientMessage, ServerMessage};

use crate::config::Config;
use crate::registry::{ChannelRegistry, Member};

/// Shared state for all relay WebSocket connections.
#[derive(Clone)]
pub struct SignalingState {
    registry: Arc<ChannelRegistry>,
    heartbeat_timeout: Duration,
    sweep_interval: Duration,
}

impl SignalingState {
    pub fn new(config: &Config) -> Self {
        let state = Self {
            registry: Arc::new(ChannelRegistry::new()),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_seconds),
            sweep_interval: Duration::from_secs(config.heartbeat_sweep_seconds),
        };

        let monitor_state = state.clone();
        tokio::spawn(async move {
            monitor_state.monitor_heartbeats().await;
        });

        state
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Sweep out connections that stopped sending heartbeats.
    async fn monitor_heartbeats(&self) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            interval.tick().await;

            // Collect heartbeat locks first to avoid holding map guards across await.
            let checks = self.registry.heartbeat_snapshot();
            let mut stale = Vec::new();
            for (channel_name, connection_id, heartbeat) in checks {
                let last = *heartbeat.read().await;
                if last.elapsed() > self.heartbeat_timeout {
                    stale.push((channel_name, connection_id));
                }
            }

            for (channel_name, connection_id) in stale {
                info!(
                    channel = %channel_name,
                    connection_id = %connection_id,
                    "removing stale connection (heartbeat timeout)"
                );
                self.registry.remove_connection(&connection_id);
            }
        }
    }
}

/// WebSocket upgrade handler.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one relay connection until it closes, then drop its memberships.
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Writer task: drain the connection's mailbox channel into the socket.
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection_id = %writer_id, "writer task ended");
    });

    debug!(connection_id = %connection_id, "websocket connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!(connection_id = %connection_id, "websocket error: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                dispatch_frame(&text, &connection_id, &state, &tx).await;
            }
            Message::Binary(data) => {
                // Tolerate binary frames carrying JSON, for client compatibility.
                if let Ok(text) = String::from_utf8(data) {
                    dispatch_frame(&text, &connection_id, &state, &tx).await;
                } else {
                    debug!(connection_id = %connection_id, "ignoring non-UTF8 binary frame");
                }
            }
            Message::Close(_) => {
                debug!(connection_id = %connection_id, "received close frame");
                break;
            }
            _ => {}
        }
    }

    state.registry.remove_connection(&connection_id);
    debug!(connection_id = %connection_id, "websocket disconnected");
}

async fn dispatch_frame(
    text: &str,
    connection_id: &str,
    state: &SignalingState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(client_msg) => {
            if let Err(e) = handle_client_message(client_msg, connection_id, state, tx).await {
                error!(connection_id = %connection_id, "error handling message: {e}");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("failed to process message: {e}"),
                });
            }
        }
        Err(e) => {
            warn!(connection_id = %connection_id, "failed to parse client message: {e}");
            let _ = tx.send(ServerMessage::Error {
                message: format!("invalid message format: {e}"),
            });
        }
    }
}

/// Handle one parsed client frame: store-and-forward first, ack second, so a
/// sender's ack never overtakes the forward on the other member's stream.
async fn handle_client_message(
    message: ClientMessage,
    connection_id: &str,
    state: &SignalingState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<()> {
    match message {
        ClientMessage::Join { channel_name } => {
            info!(
                connection_id = %connection_id,
                channel = %channel_name,
                "join"
            );
            let backlog = state
                .registry
                .join(
                    &channel_name,
                    Member {
                        connection_id: connection_id.to_string(),
                        tx: tx.clone(),
                        last_heartbeat: Arc::new(RwLock::new(Instant::now())),
                    },
                )
                .await;
            tx.send(ServerMessage::Joined {
                channel_name: channel_name.clone(),
            })?;
            // replay the candidate log so a late joiner is not stuck waiting
            // for forwards that happened before it joined
            for candidate in backlog {
                tx.send(ServerMessage::IceCandidateReceived {
                    channel_name: channel_name.clone(),
                    candidate,
                })?;
            }
        }

        ClientMessage::SubmitOffer {
            channel_name,
            offer,
        } => {
            debug!(
                connection_id = %connection_id,
                channel = %channel_name,
                len = offer.len(),
                "submit offer"
            );
            state
                .registry
                .submit_offer(&channel_name, connection_id, offer)
                .await;
            tx.send(ServerMessage::OfferSubmitted { channel_name })?;
        }

        ClientMessage::GetOffer { channel_name } => {
            let offer = state.registry.get_offer(&channel_name).await;
            debug!(
                connection_id = %connection_id,
                channel = %channel_name,
                stored = offer.is_some(),
                "get offer"
            );
            tx.send(ServerMessage::OfferRetrieved {
                channel_name,
                offer,
            })?;
        }

        ClientMessage::SubmitAnswer {
            channel_name,
            answer,
        } => {
            debug!(
                connection_id = %connection_id,
                channel = %channel_name,
                len = answer.len(),
                "submit answer"
            );
            state
                .registry
                .submit_answer(&channel_name, connection_id, answer)
                .await;
            tx.send(ServerMessage::AnswerSubmitted { channel_name })?;
        }

        ClientMessage::SubmitIceCandidate {
            channel_name,
            candidate,
        } => {
            state
                .registry
                .submit_candidate(&channel_name, connection_id, candidate)
                .await;
            tx.send(ServerMessage::IceCandidateSubmitted { channel_name })?;
        }

        ClientMessage::Ping => {
            state.registry.touch(connection_id).await;
            tx.send(ServerMessage::Pong)?;
        }
    }

    Ok(())
}
