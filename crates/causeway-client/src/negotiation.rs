//! Drives one offer/answer/candidate exchange over one peer transport.
//!
//! An engine instance corresponds to exactly one attempt to build a working
//! peer transport; reconnection never reuses an engine, it constructs a
//! fresh one. Inbound duplicates and reordering are tolerated per the
//! handshake contract; only misuse of the local API is a hard error.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::relay::RelayClient;
use crate::router::ChannelRouter;
use crate::transport::{
    DataChannel, PeerTransport, PeerTransportState, TransportError, TransportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRole {
    Undetermined,
    Offerer,
    Answerer,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The engine is already committed to the opposite role.
    #[error("engine already acting as {0:?}")]
    InvalidRoleTransition(EngineRole),
    /// A remote description was already committed on this engine instance.
    #[error("remote description already committed")]
    DuplicateDescription,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct EngineState {
    role: EngineRole,
    remote_committed: bool,
    pending_remote_candidates: Vec<String>,
    local_channel: Option<Arc<dyn DataChannel>>,
}

pub struct NegotiationEngine {
    transport: Arc<dyn PeerTransport>,
    router: Arc<ChannelRouter>,
    state: AsyncMutex<EngineState>,
}

impl NegotiationEngine {
    pub fn new(transport: Arc<dyn PeerTransport>, router: Arc<ChannelRouter>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            router,
            state: AsyncMutex::new(EngineState {
                role: EngineRole::Undetermined,
                remote_committed: false,
                pending_remote_candidates: Vec::new(),
                local_channel: None,
            }),
        })
    }

    pub async fn role(&self) -> EngineRole {
        self.state.lock().await.role
    }

    /// Generate and commit a local offer, returning it for relay submission.
    /// The local data channel is opened before the offer is generated: its
    /// existence affects the description some transports produce.
    pub async fn create_offer(&self, channel_label: &str) -> Result<String, NegotiationError> {
        let mut state = self.state.lock().await;
        match state.role {
            EngineRole::Undetermined => state.role = EngineRole::Offerer,
            EngineRole::Offerer => {}
            EngineRole::Answerer => {
                return Err(NegotiationError::InvalidRoleTransition(EngineRole::Answerer))
            }
        }

        if state.local_channel.is_none() {
            let channel = self.transport.create_data_channel(channel_label).await?;
            self.router.adopt_local(channel.clone());
            state.local_channel = Some(channel);
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        debug!(target = "causeway", "local offer committed");
        Ok(offer)
    }

    /// Commit a remote offer and produce our answer for relay submission.
    pub async fn handle_remote_offer(&self, offer: String) -> Result<String, NegotiationError> {
        let mut state = self.state.lock().await;
        match state.role {
            EngineRole::Undetermined => state.role = EngineRole::Answerer,
            EngineRole::Answerer => {}
            EngineRole::Offerer => {
                return Err(NegotiationError::InvalidRoleTransition(EngineRole::Offerer))
            }
        }
        if state.remote_committed {
            // stale or duplicate offer for an exchange already underway
            return Err(NegotiationError::DuplicateDescription);
        }

        self.transport.set_remote_description(offer).await?;
        state.remote_committed = true;
        self.flush_pending(&mut state).await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        debug!(target = "causeway", "remote offer answered");
        Ok(answer)
    }

    /// Commit the remote answer to our offer. Duplicate or misdirected
    /// answers are logged and ignored: the two event streams are
    /// independent, so some reordering is expected.
    pub async fn handle_remote_answer(&self, answer: String) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().await;
        if state.role != EngineRole::Offerer {
            warn!(
                target = "causeway",
                role = ?state.role,
                "ignoring answer: engine is not offering"
            );
            return Ok(());
        }
        if state.remote_committed {
            warn!(target = "causeway", "ignoring duplicate answer");
            return Ok(());
        }

        self.transport.set_remote_description(answer).await?;
        state.remote_committed = true;
        self.flush_pending(&mut state).await;
        debug!(target = "causeway", "remote answer committed");
        Ok(())
    }

    /// Apply a remote candidate, or queue it until a remote description is
    /// committed. Early candidates are never dropped and never error.
    pub async fn add_remote_candidate(&self, candidate: String) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().await;
        if !state.remote_committed {
            debug!(target = "causeway", "queueing candidate until remote description commits");
            state.pending_remote_candidates.push(candidate);
            return Ok(());
        }
        self.transport.add_remote_candidate(candidate).await?;
        Ok(())
    }

    async fn flush_pending(&self, state: &mut EngineState) {
        for candidate in state.pending_remote_candidates.drain(..) {
            if let Err(err) = self.transport.add_remote_candidate(candidate).await {
                warn!(target = "causeway", "queued candidate rejected: {err}");
            }
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// Pump transport events: push locally discovered candidates through the
    /// relay, hand remote channels to the router, and surface state changes.
    /// Returns `None` if the transport's event stream was already taken.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        relay: Arc<RelayClient>,
        state_tx: mpsc::UnboundedSender<PeerTransportState>,
    ) -> Option<JoinHandle<()>> {
        let mut events = self.transport.events()?;
        let router = self.router.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        if let Err(err) = relay.submit_candidate(candidate).await {
                            warn!(target = "causeway", "candidate submission failed: {err}");
                        }
                    }
                    TransportEvent::RemoteDataChannel(channel) => {
                        router.adopt_remote(channel);
                    }
                    TransportEvent::StateChanged(state) => {
                        if state_tx.send(state).is_err() {
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MessageCallback, OpenCallback};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct RecordingTransport {
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTransport {
        fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
            let ops = Arc::new(Mutex::new(Vec::new()));
            (Arc::new(Self { ops: ops.clone() }), ops)
        }
    }

    struct NullChannel;

    #[async_trait]
    impl DataChannel for NullChannel {
        fn label(&self) -> &str {
            "data"
        }
        fn is_open(&self) -> bool {
            false
        }
        async fn send(&self, _data: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        fn set_on_message(&self, _callback: MessageCallback) {}
        fn set_on_open(&self, _callback: OpenCallback) {}
        async fn close(&self) {}
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn create_offer(&self) -> Result<String, TransportError> {
            self.ops.lock().push("create_offer".into());
            Ok("offer-1".into())
        }
        async fn create_answer(&self) -> Result<String, TransportError> {
            self.ops.lock().push("create_answer".into());
            Ok("answer-1".into())
        }
        async fn set_local_description(&self, description: String) -> Result<(), TransportError> {
            self.ops.lock().push(format!("set_local:{description}"));
            Ok(())
        }
        async fn set_remote_description(&self, description: String) -> Result<(), TransportError> {
            self.ops.lock().push(format!("set_remote:{description}"));
            Ok(())
        }
        async fn add_remote_candidate(&self, candidate: String) -> Result<(), TransportError> {
            self.ops.lock().push(format!("add_candidate:{candidate}"));
            Ok(())
        }
        async fn create_data_channel(
            &self,
            label: &str,
        ) -> Result<Arc<dyn DataChannel>, TransportError> {
            self.ops.lock().push(format!("create_data_channel:{label}"));
            Ok(Arc::new(NullChannel))
        }
        fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            None
        }
        async fn close(&self) {
            self.ops.lock().push("close".into());
        }
    }

    fn engine(transport: Arc<RecordingTransport>) -> Arc<NegotiationEngine> {
        NegotiationEngine::new(transport, ChannelRouter::new(Arc::new(|_| {})))
    }

    #[tokio::test]
    async fn offer_opens_data_channel_before_generating_description() {
        let (transport, ops) = RecordingTransport::new();
        let engine = engine(transport);
        let offer = engine.create_offer("data").await.unwrap();
        assert_eq!(offer, "offer-1");
        assert_eq!(
            *ops.lock(),
            vec![
                "create_data_channel:data",
                "create_offer",
                "set_local:offer-1"
            ]
        );
    }

    #[tokio::test]
    async fn conflicting_roles_error_synchronously() {
        let (transport, _) = RecordingTransport::new();
        let engine = engine(transport);
        engine.create_offer("data").await.unwrap();
        let err = engine.handle_remote_offer("offer-x".into()).await;
        assert!(matches!(
            err,
            Err(NegotiationError::InvalidRoleTransition(EngineRole::Offerer))
        ));

        let (transport, _) = RecordingTransport::new();
        let engine = super::NegotiationEngine::new(
            transport,
            ChannelRouter::new(Arc::new(|_| {})),
        );
        engine.handle_remote_offer("offer-x".into()).await.unwrap();
        let err = engine.create_offer("data").await;
        assert!(matches!(
            err,
            Err(NegotiationError::InvalidRoleTransition(EngineRole::Answerer))
        ));
    }

    #[tokio::test]
    async fn early_candidates_queue_and_flush_in_order() {
        let (transport, ops) = RecordingTransport::new();
        let engine = engine(transport);
        engine.add_remote_candidate("c1".into()).await.unwrap();
        engine.add_remote_candidate("c2".into()).await.unwrap();
        assert!(
            ops.lock().is_empty(),
            "no transport calls before the remote description commits"
        );

        engine.handle_remote_offer("offer-x".into()).await.unwrap();
        assert_eq!(
            *ops.lock(),
            vec![
                "set_remote:offer-x",
                "add_candidate:c1",
                "add_candidate:c2",
                "create_answer",
                "set_local:answer-1"
            ]
        );

        // later candidates apply directly
        engine.add_remote_candidate("c3".into()).await.unwrap();
        assert_eq!(ops.lock().last().unwrap(), "add_candidate:c3");
    }

    #[tokio::test]
    async fn duplicate_remote_offer_is_an_error() {
        let (transport, _) = RecordingTransport::new();
        let engine = engine(transport);
        engine.handle_remote_offer("offer-1".into()).await.unwrap();
        assert!(matches!(
            engine.handle_remote_offer("offer-2".into()).await,
            Err(NegotiationError::DuplicateDescription)
        ));
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored_not_fatal() {
        let (transport, ops) = RecordingTransport::new();
        let engine = engine(transport);
        engine.create_offer("data").await.unwrap();
        engine.handle_remote_answer("answer-a".into()).await.unwrap();
        engine.handle_remote_answer("answer-b".into()).await.unwrap();

        let sets: Vec<_> = ops
            .lock()
            .iter()
            .filter(|op| op.starts_with("set_remote"))
            .cloned()
            .collect();
        assert_eq!(sets, vec!["set_remote:answer-a"]);
    }

    #[tokio::test]
    async fn answer_without_offer_is_ignored() {
        let (transport, ops) = RecordingTransport::new();
        let engine = engine(transport);
        engine.handle_remote_answer("answer-a".into()).await.unwrap();
        assert!(ops.lock().is_empty());
        assert_eq!(engine.role().await, EngineRole::Undetermined);
    }
}
