//! The peer transport seam.
//!
//! The connection machinery never touches a concrete transport: it drives
//! these traits, and the transport in turn is free to gather connectivity
//! candidates however it likes. Candidate discovery is push-based: the
//! transport emits [`TransportEvent::LocalCandidate`] whenever it finds one,
//! arbitrarily many times, in no particular order.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("transport closed")]
    Closed,
}

/// Connection-level state reported by a peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerTransportState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerTransportState {
    /// True for the states that mean a previously working peer is gone.
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            PeerTransportState::Disconnected
                | PeerTransportState::Failed
                | PeerTransportState::Closed
        )
    }
}

/// Asynchronous notifications from a peer transport.
pub enum TransportEvent {
    /// A locally discovered connectivity candidate, serialized.
    LocalCandidate(String),
    /// The transport's connection state changed.
    StateChanged(PeerTransportState),
    /// The remote side opened a data channel toward us.
    RemoteDataChannel(Arc<dyn DataChannel>),
}

pub type MessageCallback = Arc<dyn Fn(Bytes) + Send + Sync>;
pub type OpenCallback = Arc<dyn Fn() + Send + Sync>;

/// A bidirectional message channel riding on a peer transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;
    /// Register the inbound message callback. Messages that arrived before
    /// registration are delivered immediately, in order.
    fn set_on_message(&self, callback: MessageCallback);
    /// Register an open notification; fires immediately if already open.
    fn set_on_open(&self, callback: OpenCallback);
    async fn close(&self);
}

/// One point-to-point connection under negotiation. Descriptions and
/// candidates are opaque strings produced and consumed by the transport.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;
    async fn create_answer(&self) -> Result<String, TransportError>;
    async fn set_local_description(&self, description: String) -> Result<(), TransportError>;
    async fn set_remote_description(&self, description: String) -> Result<(), TransportError>;
    async fn add_remote_candidate(&self, candidate: String) -> Result<(), TransportError>;
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;
    /// Take the event stream. Yields `Some` exactly once; the negotiation
    /// engine owns the stream for the transport's lifetime.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
    async fn close(&self);
}

/// Builds a fresh transport for each negotiation attempt; transports are
/// never reused across attempts.
pub trait PeerTransportFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
