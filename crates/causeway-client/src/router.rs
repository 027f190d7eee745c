//! Routes inbound application traffic from either data channel (the one we
//! created locally or the one the remote side offered) into the single
//! application message callback. Whichever channel becomes ready first
//! delivers; neither is authoritative.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::transport::{DataChannel, MessageCallback};

#[derive(Default)]
struct Slots {
    local: Option<Arc<dyn DataChannel>>,
    remote: Option<Arc<dyn DataChannel>>,
}

pub struct ChannelRouter {
    on_message: MessageCallback,
    slots: Mutex<Slots>,
}

impl ChannelRouter {
    pub fn new(on_message: MessageCallback) -> Arc<Self> {
        Arc::new(Self {
            on_message,
            slots: Mutex::new(Slots::default()),
        })
    }

    /// Adopt the channel we created ourselves (offerer side).
    pub fn adopt_local(&self, channel: Arc<dyn DataChannel>) {
        debug!(target = "causeway", label = channel.label(), "adopting local channel");
        self.wire(&channel);
        self.slots.lock().local = Some(channel);
    }

    /// Adopt a channel the remote side opened toward us (answerer side).
    pub fn adopt_remote(&self, channel: Arc<dyn DataChannel>) {
        debug!(target = "causeway", label = channel.label(), "adopting remote channel");
        self.wire(&channel);
        self.slots.lock().remote = Some(channel);
    }

    fn wire(&self, channel: &Arc<dyn DataChannel>) {
        let on_message = self.on_message.clone();
        channel.set_on_message(Arc::new(move |data: Bytes| {
            on_message(data);
        }));
    }

    /// The channel to hand the application once the peer is up: the first
    /// adopted channel that is actually open.
    pub fn ready_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let slots = self.slots.lock();
        for slot in [&slots.local, &slots.remote] {
            if let Some(channel) = slot {
                if channel.is_open() {
                    return Some(channel.clone());
                }
            }
        }
        None
    }
}
