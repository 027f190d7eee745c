//! In-memory peer transports for tests and simulation.
//!
//! A [`MemoryTransportHub`] pairs the first two live transports created under
//! the same pairing key. A side becomes ready once it holds a local and a
//! remote description plus at least one remote candidate; when both sides of
//! a pair are ready the hub flips them to `Connected`, twins their data
//! channels, and starts delivering messages in memory.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{
    DataChannel, MessageCallback, OpenCallback, PeerTransport, PeerTransportFactory,
    PeerTransportState, TransportError, TransportEvent,
};

pub struct MemoryTransportHub {
    slots: Mutex<HashMap<String, Vec<Arc<MemoryTransport>>>>,
    next_id: AtomicU64,
}

impl MemoryTransportHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// A factory that creates transports paired under `key`, each emitting
    /// two synthetic local candidates.
    pub fn factory(self: &Arc<Self>, key: &str) -> Arc<MemoryTransportFactory> {
        self.factory_with_candidates(key, 2)
    }

    pub fn factory_with_candidates(
        self: &Arc<Self>,
        key: &str,
        candidate_count: usize,
    ) -> Arc<MemoryTransportFactory> {
        Arc::new(MemoryTransportFactory {
            hub: Arc::clone(self),
            key: key.to_string(),
            candidate_count,
        })
    }

    pub fn create_transport(
        self: &Arc<Self>,
        key: &str,
        candidate_count: usize,
    ) -> Arc<MemoryTransport> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MemoryTransport {
            id,
            key: key.to_string(),
            candidate_count,
            hub: Arc::downgrade(self),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            inner: Mutex::new(TransportInner::default()),
        });

        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_default();
        slot.retain(|t| t.is_live());
        slot.push(transport.clone());
        transport
    }

    /// Fail the current live pair under `key` on both sides, as a transport
    /// path failure would.
    pub fn fail_pair(&self, key: &str) {
        let transports = {
            let slots = self.slots.lock();
            slots
                .get(key)
                .map(|slot| slot.iter().filter(|t| t.is_live()).cloned().collect())
                .unwrap_or_else(Vec::new)
        };
        for transport in transports {
            transport.fail();
        }
    }

    /// Connect the pair under `key` if both sides are ready. Lock order is
    /// always hub slots, then transport inner, then channel state.
    fn try_connect(&self, key: &str) {
        let mut deferred: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let slots = self.slots.lock();
            let Some(slot) = slots.get(key) else { return };
            let live: Vec<_> = slot.iter().filter(|t| t.is_live()).cloned().collect();
            if live.len() < 2 {
                return;
            }
            // newest two: an abandoned transport from a superseded attempt
            // may still linger in the slot
            let (a, b) = (&live[live.len() - 2], &live[live.len() - 1]);
            {
                let mut a_inner = a.inner.lock();
                let mut b_inner = b.inner.lock();
                let ready = |inner: &TransportInner| {
                    inner.local_description.is_some()
                        && inner.remote_description.is_some()
                        && !inner.remote_candidates.is_empty()
                        && !inner.failed
                        && !inner.closed
                };
                if !ready(&a_inner) || !ready(&b_inner) {
                    return;
                }
                if a_inner.connected || b_inner.connected {
                    return;
                }
                a_inner.connected = true;
                b_inner.connected = true;
                a_inner.state = PeerTransportState::Connected;
                b_inner.state = PeerTransportState::Connected;

                wire_channels(a, &a_inner, b, &mut deferred);
                wire_channels(b, &b_inner, a, &mut deferred);
            }
            for side in [a, b] {
                let events = side.events_tx.clone();
                deferred.push(Box::new(move || {
                    let _ = events.send(TransportEvent::StateChanged(
                        PeerTransportState::Connected,
                    ));
                }));
            }
            debug!(key, a = a.id, b = b.id, "memory transports connected");
        }
        for action in deferred {
            action();
        }
    }
}

/// Give each of `from`'s local channels a twin on `to`'s side and queue the
/// open notifications and the remote-channel event.
fn wire_channels(
    from: &Arc<MemoryTransport>,
    from_inner: &TransportInner,
    to: &Arc<MemoryTransport>,
    deferred: &mut Vec<Box<dyn FnOnce() + Send>>,
) {
    for local in &from_inner.local_channels {
        let twin = Arc::new(MemoryDataChannel::new(local.label.clone()));
        *local.peer_strong.lock() = Some(twin.clone());
        *twin.peer_weak.lock() = Some(Arc::downgrade(local));

        let local = local.clone();
        let twin_for_open = twin.clone();
        let events = to.events_tx.clone();
        deferred.push(Box::new(move || {
            let _ = events.send(TransportEvent::RemoteDataChannel(twin.clone()));
            local.mark_open();
            twin_for_open.mark_open();
        }));
    }
}

pub struct MemoryTransportFactory {
    hub: Arc<MemoryTransportHub>,
    key: String,
    candidate_count: usize,
}

impl PeerTransportFactory for MemoryTransportFactory {
    fn create(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(self.hub.create_transport(&self.key, self.candidate_count))
    }
}

#[derive(Default)]
struct TransportInner {
    local_description: Option<String>,
    remote_description: Option<String>,
    remote_candidates: Vec<String>,
    local_channels: Vec<Arc<MemoryDataChannel>>,
    state: PeerTransportState,
    connected: bool,
    failed: bool,
    closed: bool,
}

pub struct MemoryTransport {
    id: u64,
    key: String,
    candidate_count: usize,
    hub: Weak<MemoryTransportHub>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    inner: Mutex<TransportInner>,
}

impl MemoryTransport {
    fn is_live(&self) -> bool {
        let inner = self.inner.lock();
        !inner.failed && !inner.closed
    }

    fn is_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.local_description.is_some()
            && inner.remote_description.is_some()
            && !inner.remote_candidates.is_empty()
            && !inner.failed
            && !inner.closed
    }

    pub fn state(&self) -> PeerTransportState {
        self.inner.lock().state
    }

    fn notify_hub(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.try_connect(&self.key);
        }
    }

    /// Drop into `Failed` and close all channels, as a path failure would.
    pub fn fail(&self) {
        let channels = {
            let mut inner = self.inner.lock();
            if inner.failed || inner.closed {
                return;
            }
            inner.failed = true;
            inner.state = PeerTransportState::Failed;
            std::mem::take(&mut inner.local_channels)
        };
        for channel in channels {
            channel.mark_closed();
        }
        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged(PeerTransportState::Failed));
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        Ok(format!("offer:{}:{}", self.key, self.id))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        Ok(format!("answer:{}:{}", self.key, self.id))
    }

    async fn set_local_description(&self, description: String) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.local_description = Some(description);
            if inner.state == PeerTransportState::New {
                inner.state = PeerTransportState::Connecting;
            }
        }
        // candidate gathering starts once a local description is committed
        for n in 0..self.candidate_count {
            let _ = self.events_tx.send(TransportEvent::LocalCandidate(format!(
                "candidate:{}:{}",
                self.id, n
            )));
        }
        self.notify_hub();
        Ok(())
    }

    async fn set_remote_description(&self, description: String) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.remote_description = Some(description);
        }
        self.notify_hub();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: String) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.remote_description.is_none() {
                return Err(TransportError::Candidate(
                    "no remote description committed".into(),
                ));
            }
            inner.remote_candidates.push(candidate);
        }
        self.notify_hub();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = Arc::new(MemoryDataChannel::new(label.to_string()));
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        inner.local_channels.push(channel.clone());
        Ok(channel)
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        let channels = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.state = PeerTransportState::Closed;
            std::mem::take(&mut inner.local_channels)
        };
        for channel in channels {
            channel.mark_closed();
        }
    }
}

pub struct MemoryDataChannel {
    label: String,
    open: AtomicBool,
    peer_strong: Mutex<Option<Arc<MemoryDataChannel>>>,
    peer_weak: Mutex<Option<Weak<MemoryDataChannel>>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_open: Mutex<Option<OpenCallback>>,
    inbox: Mutex<Vec<Bytes>>,
}

impl MemoryDataChannel {
    fn new(label: String) -> Self {
        Self {
            label,
            open: AtomicBool::new(false),
            peer_strong: Mutex::new(None),
            peer_weak: Mutex::new(None),
            on_message: Mutex::new(None),
            on_open: Mutex::new(None),
            inbox: Mutex::new(Vec::new()),
        }
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let callback = self.on_open.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(peer) = self.peer_strong.lock().as_ref() {
            peer.open.store(false, Ordering::SeqCst);
        }
    }

    fn peer(&self) -> Option<Arc<MemoryDataChannel>> {
        if let Some(peer) = self.peer_strong.lock().as_ref() {
            return Some(peer.clone());
        }
        self.peer_weak.lock().as_ref().and_then(Weak::upgrade)
    }

    fn deliver(&self, data: Bytes) {
        let callback = { self.on_message.lock().clone() };
        match callback {
            Some(callback) => callback(data),
            None => self.inbox.lock().push(data),
        }
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        match self.peer() {
            Some(peer) => {
                peer.deliver(data);
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    fn set_on_message(&self, callback: MessageCallback) {
        let backlog = {
            let mut on_message = self.on_message.lock();
            *on_message = Some(callback.clone());
            std::mem::take(&mut *self.inbox.lock())
        };
        for data in backlog {
            callback(data);
        }
    }

    fn set_on_open(&self, callback: OpenCallback) {
        if self.is_open() {
            callback();
        } else {
            *self.on_open.lock() = Some(callback);
        }
    }

    async fn close(&self) {
        self.mark_closed();
    }
}
