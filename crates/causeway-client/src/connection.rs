//! The connection state machine.
//!
//! A [`Connector`] owns the current session generation: one relay
//! connection, one negotiation engine, and the tasks driving them. Losing
//! the peer transport does not reset anything in place: the whole
//! generation is torn down (tasks aborted, socket closed, transport closed)
//! and a fresh one is constructed, which is what keeps stale listeners and
//! orphaned timers from leaking across reconnects. Every task and timer
//! checks that its generation is still current before acting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::negotiation::{NegotiationEngine, NegotiationError};
use crate::relay::{RelayClient, RelayError, RelayEvent, RelaySettings};
use crate::router::ChannelRouter;
use crate::transport::{DataChannel, MessageCallback, PeerTransportFactory, PeerTransportState};

/// Externally visible lifecycle position of one client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    /// Constructed; relay connection not yet acknowledged.
    Uninitialized,
    /// Relay connection confirmed and channel joined.
    SignalingUp,
    /// Peer transport connected and a usable data channel exists.
    PeerConnected,
    /// Relay deliberately dropped after a successful peer connection.
    SignalingDown,
    /// Peer transport lost; terminal for this generation.
    PeerLost,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("operation invalid in stage {0:?}")]
    InvalidStage(ConnectionStage),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connector closed")]
    Closed,
}

pub type PeerReadyCallback = Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ConnectionStage) + Send + Sync>;

pub struct ConnectionCallbacks {
    /// Receives every inbound application message, whichever data channel
    /// carried it.
    pub on_message: MessageCallback,
    /// Fires exactly once per successful session with the usable channel.
    pub on_peer_ready: PeerReadyCallback,
    /// Observes each stage transition, in order, exactly once.
    pub on_status: Option<StatusCallback>,
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub relay_url: String,
    pub channel_name: String,
    pub data_channel_label: String,
    /// Interval for bounded readiness polling.
    pub poll_interval: Duration,
    /// Attempt cap for bounded readiness polling.
    pub poll_attempts: u32,
    /// Grace delay before an offerer re-offers after a rebuild, giving the
    /// remote rebuild time to reach SignalingUp first.
    pub reoffer_grace: Duration,
    pub relay: RelaySettings,
}

impl ConnectorConfig {
    pub fn new(relay_url: impl Into<String>, channel_name: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            channel_name: channel_name.into(),
            data_channel_label: "data".to_string(),
            poll_interval: Duration::from_millis(250),
            poll_attempts: 40,
            reoffer_grace: Duration::from_millis(750),
            relay: RelaySettings::default(),
        }
    }
}

struct ConnectorInner {
    config: ConnectorConfig,
    factory: Arc<dyn PeerTransportFactory>,
    callbacks: ConnectionCallbacks,
    generation: AtomicU64,
    closed: AtomicBool,
    stage_tx: watch::Sender<ConnectionStage>,
    current: AsyncMutex<Option<Arc<Session>>>,
}

impl ConnectorInner {
    fn set_stage(&self, next: ConnectionStage) {
        let changed = self.stage_tx.send_if_modified(|stage| {
            if *stage == next {
                false
            } else {
                *stage = next;
                true
            }
        });
        if changed {
            info!(target = "causeway", stage = ?next, "stage transition");
            if let Some(on_status) = &self.callbacks.on_status {
                on_status(next);
            }
        }
    }

    fn stage(&self) -> ConnectionStage {
        *self.stage_tx.borrow()
    }
}

/// One generation: relay connection + negotiation engine + driver tasks.
struct Session {
    generation: u64,
    relay: Arc<RelayClient>,
    router: Arc<ChannelRouter>,
    engine: AsyncMutex<Option<Arc<NegotiationEngine>>>,
    state_tx: mpsc::UnboundedSender<PeerTransportState>,
    transport_connected: AtomicBool,
    peer_ready_fired: AtomicBool,
    offered: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    async fn start(inner: &Arc<ConnectorInner>, generation: u64) -> Result<Arc<Self>, ConnectError> {
        let relay = RelayClient::connect(
            &inner.config.relay_url,
            &inner.config.channel_name,
            &inner.config.relay,
        )
        .await?;
        let router = ChannelRouter::new(inner.callbacks.on_message.clone());
        let (state_tx, state_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Session {
            generation,
            relay: relay.clone(),
            router,
            engine: AsyncMutex::new(None),
            state_tx,
            transport_connected: AtomicBool::new(false),
            peer_ready_fired: AtomicBool::new(false),
            offered: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let relay_events = relay
            .take_events()
            .await
            .ok_or(RelayError::ChannelClosed)?;
        let events_task = tokio::spawn(run_relay_events(
            inner.clone(),
            session.clone(),
            relay_events,
        ));
        let watch_task = tokio::spawn(run_transport_watch(
            inner.clone(),
            session.clone(),
            state_rx,
        ));
        {
            let mut tasks = session.tasks.lock();
            tasks.push(events_task);
            tasks.push(watch_task);
        }
        Ok(session)
    }

    fn is_current(&self, inner: &ConnectorInner) -> bool {
        inner.generation.load(Ordering::SeqCst) == self.generation
    }

    /// The current engine, created on demand; inbound messages may race
    /// ahead of any local action.
    async fn ensure_engine(
        &self,
        inner: &Arc<ConnectorInner>,
    ) -> Result<Arc<NegotiationEngine>, ConnectError> {
        let mut guard = self.engine.lock().await;
        if let Some(engine) = guard.as_ref() {
            return Ok(engine.clone());
        }
        if !self.is_current(inner) {
            // a superseded generation must not construct new transports
            return Err(ConnectError::Closed);
        }
        let transport = inner.factory.create().map_err(NegotiationError::from)?;
        let engine = NegotiationEngine::new(transport, self.router.clone());
        if let Some(handle) = engine.spawn_event_pump(self.relay.clone(), self.state_tx.clone()) {
            self.tasks.lock().push(handle);
        }
        *guard = Some(engine.clone());
        Ok(engine)
    }

    /// Release everything this generation holds: abort its tasks, close its
    /// relay socket, close its transport.
    async fn teardown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.relay.close();
        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            engine.close().await;
        }
    }
}

/// The public client surface.
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    /// Open a relay connection, join the configured channel, and start the
    /// state machine. Resolves once SignalingUp is reached.
    pub async fn connect(
        config: ConnectorConfig,
        factory: Arc<dyn PeerTransportFactory>,
        callbacks: ConnectionCallbacks,
    ) -> Result<Self, ConnectError> {
        let (stage_tx, _stage_rx) = watch::channel(ConnectionStage::Uninitialized);
        let inner = Arc::new(ConnectorInner {
            config,
            factory,
            callbacks,
            generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            stage_tx,
            current: AsyncMutex::new(None),
        });
        if let Some(on_status) = &inner.callbacks.on_status {
            on_status(ConnectionStage::Uninitialized);
        }

        let session = Session::start(&inner, 1).await?;
        *inner.current.lock().await = Some(session.clone());
        inner.set_stage(ConnectionStage::SignalingUp);

        // Late join: pick up an offer stored before we joined. Only the
        // first generation does this. After a rebuild the offerer re-issues
        // a fresh offer, and replaying a stored one would be stale.
        match session.relay.get_offer().await {
            Ok(Some(offer)) => {
                debug!(target = "causeway", "adopting stored offer from relay");
                dispatch_offer(&inner, &session, offer).await;
            }
            Ok(None) => {}
            Err(err) => warn!(target = "causeway", "stored offer fetch failed: {err}"),
        }

        Ok(Self { inner })
    }

    pub fn stage(&self) -> ConnectionStage {
        self.inner.stage()
    }

    /// A watch of stage transitions, for callers that prefer awaiting over
    /// the `on_status` callback.
    pub fn watch_stage(&self) -> watch::Receiver<ConnectionStage> {
        self.inner.stage_tx.subscribe()
    }

    /// Start negotiation as the offerer. Callable before SignalingUp is
    /// reached: arms a bounded wait for the stage instead of failing.
    pub async fn create_offer(&self) -> Result<(), ConnectError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        match self.inner.stage() {
            ConnectionStage::SignalingUp => {}
            ConnectionStage::Uninitialized | ConnectionStage::PeerLost => {
                wait_for_stage(&self.inner, ConnectionStage::SignalingUp).await?;
            }
            stage => return Err(ConnectError::InvalidStage(stage)),
        }
        let session = current_session(&self.inner).await?;
        create_offer_on(&self.inner, &session).await
    }

    /// Deliberately drop the relay connection once the peer transport is up;
    /// the relay is no longer needed and idle connections cost it memory.
    pub async fn disconnect_from_relay(&self) -> Result<(), ConnectError> {
        let stage = self.inner.stage();
        if stage != ConnectionStage::PeerConnected {
            return Err(ConnectError::InvalidStage(stage));
        }
        let session = current_session(&self.inner).await?;
        self.inner.set_stage(ConnectionStage::SignalingDown);
        session.relay.close();
        Ok(())
    }

    /// Stop the machine for good: no further rebuilds, all resources
    /// released.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let old = self.inner.current.lock().await.take();
        if let Some(old) = old {
            old.teardown().await;
        }
    }
}

async fn current_session(inner: &Arc<ConnectorInner>) -> Result<Arc<Session>, ConnectError> {
    inner
        .current
        .lock()
        .await
        .clone()
        .ok_or(ConnectError::Closed)
}

async fn create_offer_on(
    inner: &Arc<ConnectorInner>,
    session: &Arc<Session>,
) -> Result<(), ConnectError> {
    let engine = session.ensure_engine(inner).await?;
    let offer = engine
        .create_offer(&inner.config.data_channel_label)
        .await?;
    session.offered.store(true, Ordering::SeqCst);
    session.relay.submit_offer(offer).await?;
    Ok(())
}

/// Bounded wait for a stage; never an unbounded silent poll.
async fn wait_for_stage(
    inner: &Arc<ConnectorInner>,
    want: ConnectionStage,
) -> Result<(), ConnectError> {
    let mut rx = inner.stage_tx.subscribe();
    let deadline = inner.config.poll_interval * inner.config.poll_attempts.max(1);
    tokio::time::timeout(deadline, async {
        loop {
            if *rx.borrow_and_update() == want {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(ConnectError::Closed);
            }
        }
    })
    .await
    .map_err(|_| ConnectError::Timeout("signaling to come up"))?
}

/// Feed a remote offer into the engine and submit the produced answer.
/// Inbound protocol violations are logged, never fatal.
async fn dispatch_offer(inner: &Arc<ConnectorInner>, session: &Arc<Session>, offer: String) {
    match session.ensure_engine(inner).await {
        Ok(engine) => match engine.handle_remote_offer(offer).await {
            Ok(answer) => {
                if let Err(err) = session.relay.submit_answer(answer).await {
                    warn!(target = "causeway", "answer submission failed: {err}");
                }
            }
            Err(err) => warn!(target = "causeway", "ignoring offer: {err}"),
        },
        Err(err) => warn!(target = "causeway", "engine unavailable for offer: {err}"),
    }
}

/// Dispatch forwarded relay traffic into the current engine.
async fn run_relay_events(
    inner: Arc<ConnectorInner>,
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
) {
    while let Some(event) = events.recv().await {
        if !session.is_current(&inner) {
            break;
        }
        match event {
            RelayEvent::OfferReceived(offer) => {
                dispatch_offer(&inner, &session, offer).await;
            }
            RelayEvent::AnswerReceived(answer) => match session.ensure_engine(&inner).await {
                Ok(engine) => {
                    if let Err(err) = engine.handle_remote_answer(answer).await {
                        warn!(target = "causeway", "ignoring answer: {err}");
                    }
                }
                Err(err) => warn!(target = "causeway", "engine unavailable for answer: {err}"),
            },
            RelayEvent::CandidateReceived(candidate) => {
                match session.ensure_engine(&inner).await {
                    Ok(engine) => {
                        if let Err(err) = engine.add_remote_candidate(candidate).await {
                            warn!(target = "causeway", "ignoring candidate: {err}");
                        }
                    }
                    Err(err) => {
                        warn!(target = "causeway", "engine unavailable for candidate: {err}")
                    }
                }
            }
            RelayEvent::Closed => {
                if !session.is_current(&inner) || inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                match inner.stage() {
                    ConnectionStage::PeerConnected | ConnectionStage::SignalingDown => {
                        // the peer is up; the relay is no longer load-bearing
                        debug!(target = "causeway", "relay connection closed after peer came up");
                    }
                    _ => {
                        info!(target = "causeway", "relay connection lost; rebuilding session");
                        spawn_rebuild(
                            inner.clone(),
                            session.generation,
                            session.offered.load(Ordering::SeqCst),
                            false,
                        );
                    }
                }
                break;
            }
        }
    }
}

/// Combine the two independent readiness signals (transport connected and
/// data channel usable) into the PeerConnected transition, and turn
/// transport loss into a full rebuild.
async fn run_transport_watch(
    inner: Arc<ConnectorInner>,
    session: Arc<Session>,
    mut state_rx: mpsc::UnboundedReceiver<PeerTransportState>,
) {
    while let Some(state) = state_rx.recv().await {
        if !session.is_current(&inner) {
            break;
        }
        match state {
            PeerTransportState::Connected => {
                session.transport_connected.store(true, Ordering::SeqCst);
                await_channel_and_announce(&inner, &session).await;
            }
            state if state.is_lost() => {
                if session.transport_connected.load(Ordering::SeqCst) {
                    info!(target = "causeway", ?state, "peer transport lost");
                    spawn_rebuild(
                        inner.clone(),
                        session.generation,
                        session.offered.load(Ordering::SeqCst),
                        true,
                    );
                    break;
                }
                warn!(target = "causeway", ?state, "transport ended before connecting");
            }
            _ => {}
        }
    }
}

/// The transport says connected; wait (bounded) for a usable data channel,
/// then announce the peer exactly once.
async fn await_channel_and_announce(inner: &Arc<ConnectorInner>, session: &Arc<Session>) {
    for _ in 0..inner.config.poll_attempts.max(1) {
        if !session.is_current(inner) {
            return;
        }
        if let Some(channel) = session.router.ready_channel() {
            inner.set_stage(ConnectionStage::PeerConnected);
            if !session.peer_ready_fired.swap(true, Ordering::SeqCst) {
                (inner.callbacks.on_peer_ready)(channel);
            }
            return;
        }
        tokio::time::sleep(inner.config.poll_interval).await;
    }
    warn!(
        target = "causeway",
        "no data channel became usable within the polling bound"
    );
}

/// Tear down the lost generation and construct a brand-new one. If the lost
/// session had offered, re-offer after a grace delay so the remote rebuild
/// reaches SignalingUp first.
fn spawn_rebuild(
    inner: Arc<ConnectorInner>,
    lost_generation: u64,
    was_offerer: bool,
    peer_lost: bool,
) {
    tokio::spawn(async move {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        // only the generation that is still current may trigger a rebuild
        if inner
            .generation
            .compare_exchange(
                lost_generation,
                lost_generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let new_generation = lost_generation + 1;

        if peer_lost {
            inner.set_stage(ConnectionStage::PeerLost);
        }
        let old = inner.current.lock().await.take();
        if let Some(old) = old {
            old.teardown().await;
        }
        inner.set_stage(ConnectionStage::Uninitialized);

        match Session::start(&inner, new_generation).await {
            Ok(session) => {
                *inner.current.lock().await = Some(session.clone());
                inner.set_stage(ConnectionStage::SignalingUp);
                info!(target = "causeway", generation = new_generation, "session rebuilt");

                if was_offerer {
                    // the answerer's rebuild must be signaling-ready before
                    // our new offer goes out
                    tokio::time::sleep(inner.config.reoffer_grace).await;
                    if inner.generation.load(Ordering::SeqCst) != new_generation
                        || inner.closed.load(Ordering::SeqCst)
                    {
                        return;
                    }
                    if let Err(err) = create_offer_on(&inner, &session).await {
                        warn!(target = "causeway", "re-offer failed: {err}");
                    }
                }
            }
            Err(err) => {
                warn!(target = "causeway", "session rebuild failed: {err}");
            }
        }
    });
}
