//! Client side of the relay connection.
//!
//! One [`RelayClient`] owns one WebSocket to the relay, joined to one
//! channel. A writer task drains outbound frames, a reader task resolves
//! submission acks and surfaces forwarded handshake messages as
//! [`RelayEvent`]s, and a heartbeat task keeps the connection alive.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use causeway_proto::{ClientMessage, ServerMessage};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay connection closed")]
    ChannelClosed,
    #[error("timed out waiting for relay acknowledgment")]
    AckTimeout,
}

/// Handshake traffic forwarded to us by the relay.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    OfferReceived(String),
    AnswerReceived(String),
    CandidateReceived(String),
    /// The relay socket closed (deliberately or not).
    Closed,
}

/// Tunables for the relay connection; defaults match a local relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_backoff: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Per-kind FIFO queues of waiters for submission acks. Ack replies arrive
/// in submission order on the single relay socket.
#[derive(Default)]
struct AckTable {
    offer: Mutex<VecDeque<oneshot::Sender<()>>>,
    answer: Mutex<VecDeque<oneshot::Sender<()>>>,
    candidate: Mutex<VecDeque<oneshot::Sender<()>>>,
    offer_fetch: Mutex<VecDeque<oneshot::Sender<Option<String>>>>,
}

fn resolve(queue: &Mutex<VecDeque<oneshot::Sender<()>>>) {
    if let Some(waiter) = queue.lock().pop_front() {
        let _ = waiter.send(());
    }
}

pub struct RelayClient {
    channel_name: String,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    acks: Arc<AckTable>,
    ack_timeout: Duration,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayClient {
    /// Dial the relay (with bounded backoff retries), join `channel_name`,
    /// and resolve once the relay acknowledges the join.
    pub async fn connect(
        relay_url: &str,
        channel_name: &str,
        settings: &RelaySettings,
    ) -> Result<Arc<Self>, RelayError> {
        let ws_url = build_signaling_url(relay_url)?;

        let mut last_err = None;
        let mut ws_stream = None;
        for attempt in 0..settings.connect_attempts.max(1) {
            match connect_async(ws_url.as_str()).await {
                Ok((stream, _)) => {
                    ws_stream = Some(stream);
                    break;
                }
                Err(err) => {
                    tracing::debug!(
                        target = "causeway",
                        url = %ws_url,
                        attempt,
                        "relay connect failed: {err}"
                    );
                    last_err = Some(err);
                    let backoff = settings.connect_backoff * 2u32.saturating_pow(attempt.min(4));
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        }
        let ws_stream = ws_stream.ok_or_else(|| {
            RelayError::Unavailable(
                last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no connection attempts made".into()),
            )
        })?;
        tracing::debug!(target = "causeway", url = %ws_url, "relay websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<RelayEvent>();
        let acks = Arc::new(AckTable::default());
        let (join_tx, join_rx) = oneshot::channel::<()>();

        let client = Arc::new(RelayClient {
            channel_name: channel_name.to_string(),
            send_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
            acks: acks.clone(),
            ack_timeout: settings.ack_timeout,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&message) {
                    if ws_write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader_channel = channel_name.to_string();
        let reader_acks = acks;
        let reader_handle = tokio::spawn(async move {
            let mut join_tx = Some(join_tx);
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(server_msg) =
                            serde_json::from_str::<ServerMessage>(text.as_ref())
                        {
                            handle_server_message(
                                server_msg,
                                &reader_channel,
                                &reader_acks,
                                &events_tx,
                                &mut join_tx,
                            );
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data.to_vec()) {
                            if let Ok(server_msg) = serde_json::from_str::<ServerMessage>(&text) {
                                handle_server_message(
                                    server_msg,
                                    &reader_channel,
                                    &reader_acks,
                                    &events_tx,
                                    &mut join_tx,
                                );
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target = "causeway", "relay websocket error: {err}");
                        break;
                    }
                }
            }
            let _ = events_tx.send(RelayEvent::Closed);
        });

        let heartbeat_tx = client.send_tx.clone();
        let heartbeat_interval = settings.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        {
            let mut tasks = client.tasks.lock();
            tasks.push(writer_handle);
            tasks.push(reader_handle);
            tasks.push(heartbeat_handle);
        }

        client
            .send_tx
            .send(ClientMessage::Join {
                channel_name: channel_name.to_string(),
            })
            .map_err(|_| RelayError::ChannelClosed)?;

        match tokio::time::timeout(settings.ack_timeout, join_rx).await {
            Ok(Ok(())) => {
                tracing::debug!(target = "causeway", channel = %channel_name, "joined channel");
                Ok(client)
            }
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => Err(RelayError::AckTimeout),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Take the inbound event stream. Yields `Some` exactly once.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn submit_offer(&self, offer: String) -> Result<(), RelayError> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.acks.offer.lock().push_back(tx);
            rx
        };
        self.send(ClientMessage::SubmitOffer {
            channel_name: self.channel_name.clone(),
            offer,
        })?;
        self.await_ack(rx).await
    }

    pub async fn submit_answer(&self, answer: String) -> Result<(), RelayError> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.acks.answer.lock().push_back(tx);
            rx
        };
        self.send(ClientMessage::SubmitAnswer {
            channel_name: self.channel_name.clone(),
            answer,
        })?;
        self.await_ack(rx).await
    }

    pub async fn submit_candidate(&self, candidate: String) -> Result<(), RelayError> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.acks.candidate.lock().push_back(tx);
            rx
        };
        self.send(ClientMessage::SubmitIceCandidate {
            channel_name: self.channel_name.clone(),
            candidate,
        })?;
        self.await_ack(rx).await
    }

    /// Fetch the stored offer for the channel (`None` when nothing stored).
    pub async fn get_offer(&self) -> Result<Option<String>, RelayError> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.acks.offer_fetch.lock().push_back(tx);
            rx
        };
        self.send(ClientMessage::GetOffer {
            channel_name: self.channel_name.clone(),
        })?;
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(offer)) => Ok(offer),
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => Err(RelayError::AckTimeout),
        }
    }

    fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelClosed);
        }
        self.send_tx
            .send(message)
            .map_err(|_| RelayError::ChannelClosed)
    }

    async fn await_ack(&self, rx: oneshot::Receiver<()>) -> Result<(), RelayError> {
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => Err(RelayError::AckTimeout),
        }
    }

    /// Drop the relay connection and stop all of its tasks.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn handle_server_message(
    message: ServerMessage,
    channel_name: &str,
    acks: &AckTable,
    events_tx: &mpsc::UnboundedSender<RelayEvent>,
    join_tx: &mut Option<oneshot::Sender<()>>,
) {
    match message {
        ServerMessage::Joined { .. } => {
            if let Some(tx) = join_tx.take() {
                let _ = tx.send(());
            }
        }
        ServerMessage::OfferSubmitted { .. } => resolve(&acks.offer),
        ServerMessage::AnswerSubmitted { .. } => resolve(&acks.answer),
        ServerMessage::IceCandidateSubmitted { .. } => resolve(&acks.candidate),
        ServerMessage::OfferRetrieved { offer, .. } => {
            if let Some(waiter) = acks.offer_fetch.lock().pop_front() {
                let _ = waiter.send(offer);
            }
        }
        ServerMessage::OfferReceived {
            channel_name: channel,
            offer,
        } => {
            if channel == channel_name {
                let _ = events_tx.send(RelayEvent::OfferReceived(offer));
            } else {
                tracing::warn!(target = "causeway", channel, "offer for unexpected channel");
            }
        }
        ServerMessage::AnswerReceived {
            channel_name: channel,
            answer,
        } => {
            if channel == channel_name {
                let _ = events_tx.send(RelayEvent::AnswerReceived(answer));
            } else {
                tracing::warn!(target = "causeway", channel, "answer for unexpected channel");
            }
        }
        ServerMessage::IceCandidateReceived {
            channel_name: channel,
            candidate,
        } => {
            if channel == channel_name {
                let _ = events_tx.send(RelayEvent::CandidateReceived(candidate));
            } else {
                tracing::warn!(
                    target = "causeway",
                    channel,
                    "candidate for unexpected channel"
                );
            }
        }
        ServerMessage::Pong => {}
        ServerMessage::Error { message } => {
            tracing::warn!(target = "causeway", "relay reported error: {message}");
        }
    }
}

fn build_signaling_url(relay_url: &str) -> Result<Url, RelayError> {
    let mut url =
        Url::parse(relay_url).map_err(|err| RelayError::InvalidUrl(format!("{relay_url}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(RelayError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    }
    if !url.path().trim_end_matches('/').ends_with("/ws") {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| RelayError::InvalidUrl("cannot mutate url path".into()))?;
        segments.pop_if_empty();
        segments.push("ws");
    }
    Ok(url)
}
