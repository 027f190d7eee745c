use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use causeway_proto::ServerMessage;

/// One connected socket's handle inside a channel mailbox.
#[derive(Clone)]
pub struct Member {
    pub connection_id: String,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
    pub last_heartbeat: Arc<RwLock<Instant>>,
}

#[derive(Default)]
struct StoredHandshake {
    last_offer: Option<String>,
    last_answer: Option<String>,
    candidates: Vec<String>,
}

/// Relay-side state for one channel: current members plus the stored
/// offer/answer/candidate log that late joiners replay from.
pub struct Mailbox {
    name: String,
    members: DashMap<String, Member>,
    stored: RwLock<StoredHandshake>,
}

impl Mailbox {
    fn new(name: String) -> Self {
        Self {
            name,
            members: DashMap::new(),
            stored: RwLock::new(StoredHandshake::default()),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub async fn candidate_count(&self) -> usize {
        self.stored.read().await.candidates.len()
    }

    /// Send a message to every member except the sender. A channel with no
    /// other member makes this a no-op; dead senders are skipped, the socket
    /// loop cleans them up on disconnect.
    fn forward_except(&self, sender_id: &str, message: &ServerMessage) {
        for member in self.members.iter() {
            if member.connection_id == sender_id {
                continue;
            }
            if member.tx.send(message.clone()).is_err() {
                debug!(
                    channel = %self.name,
                    connection_id = %member.connection_id,
                    "member channel closed; skipping forward"
                );
            }
        }
    }
}

/// All channel mailboxes, keyed by channel name. Mutation goes through the
/// owning mailbox's lock so unrelated channels never serialize on each other.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<Mailbox>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, channel_name: &str) -> Arc<Mailbox> {
        self.channels
            .entry(channel_name.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new(channel_name.to_string())))
            .clone()
    }

    pub fn get(&self, channel_name: &str) -> Option<Arc<Mailbox>> {
        self.channels.get(channel_name).map(|entry| entry.clone())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Add a connection to a channel, creating the mailbox if absent.
    /// Membership is unbounded here; two-party use is convention. Returns
    /// the stored candidate backlog so the caller can replay it to the new
    /// member, since a late joiner missed the original forwards.
    pub async fn join(&self, channel_name: &str, member: Member) -> Vec<String> {
        let mailbox = self.mailbox(channel_name);
        mailbox
            .members
            .insert(member.connection_id.clone(), member);
        let candidates = mailbox.stored.read().await.candidates.clone();
        candidates
    }

    /// Store the offer (overwriting any previous one) and forward it to the
    /// other current members.
    pub async fn submit_offer(&self, channel_name: &str, sender_id: &str, offer: String) {
        let mailbox = self.mailbox(channel_name);
        {
            let mut stored = mailbox.stored.write().await;
            stored.last_offer = Some(offer.clone());
        }
        mailbox.forward_except(
            sender_id,
            &ServerMessage::OfferReceived {
                channel_name: channel_name.to_string(),
                offer,
            },
        );
    }

    /// Stored offer for the channel, or `None` if nothing was submitted yet
    /// (querying before population never blocks or errors).
    pub async fn get_offer(&self, channel_name: &str) -> Option<String> {
        let mailbox = self.get(channel_name)?;
        let stored = mailbox.stored.read().await;
        stored.last_offer.clone()
    }

    pub async fn submit_answer(&self, channel_name: &str, sender_id: &str, answer: String) {
        let mailbox = self.mailbox(channel_name);
        {
            let mut stored = mailbox.stored.write().await;
            stored.last_answer = Some(answer.clone());
        }
        mailbox.forward_except(
            sender_id,
            &ServerMessage::AnswerReceived {
                channel_name: channel_name.to_string(),
                answer,
            },
        );
    }

    /// Append to the candidate log and forward. The log only grows while the
    /// channel has members; it is purged with the mailbox on membership-empty.
    pub async fn submit_candidate(&self, channel_name: &str, sender_id: &str, candidate: String) {
        let mailbox = self.mailbox(channel_name);
        {
            let mut stored = mailbox.stored.write().await;
            stored.candidates.push(candidate.clone());
        }
        mailbox.forward_except(
            sender_id,
            &ServerMessage::IceCandidateReceived {
                channel_name: channel_name.to_string(),
                candidate,
            },
        );
    }

    /// Refresh the heartbeat timestamp on every membership of a connection.
    pub async fn touch(&self, connection_id: &str) {
        let mut heartbeats = Vec::new();
        for entry in self.channels.iter() {
            if let Some(member) = entry.members.get(connection_id) {
                heartbeats.push(member.last_heartbeat.clone());
            }
        }
        for heartbeat in heartbeats {
            *heartbeat.write().await = Instant::now();
        }
    }

    /// Remove a connection from every channel it joined. Mailboxes whose
    /// membership empties are deleted, purging their stored handshake state.
    pub fn remove_connection(&self, connection_id: &str) {
        let mut emptied = Vec::new();
        for entry in self.channels.iter() {
            entry.members.remove(connection_id);
            if entry.members.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for channel_name in emptied {
            let removed = self
                .channels
                .remove_if(&channel_name, |_, mailbox| mailbox.members.is_empty());
            if removed.is_some() {
                debug!(channel = %channel_name, "mailbox purged (membership empty)");
            }
        }
    }

    /// Collect (channel, connection, heartbeat) triples without holding map
    /// guards across an await.
    pub fn heartbeat_snapshot(&self) -> Vec<(String, String, Arc<RwLock<Instant>>)> {
        let mut checks = Vec::new();
        for entry in self.channels.iter() {
            for member in entry.members.iter() {
                checks.push((
                    entry.key().clone(),
                    member.connection_id.clone(),
                    member.last_heartbeat.clone(),
                ));
            }
        }
        checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> (Member, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Member {
                connection_id: id.to_string(),
                tx,
                last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn offer_storage_is_last_writer_wins() {
        let registry = ChannelRegistry::new();
        registry.submit_offer("room1", "a", "offer-1".into()).await;
        registry.submit_offer("room1", "a", "offer-2".into()).await;
        assert_eq!(registry.get_offer("room1").await.as_deref(), Some("offer-2"));
        // idempotent reads with no intervening submit
        assert_eq!(registry.get_offer("room1").await.as_deref(), Some("offer-2"));
    }

    #[tokio::test]
    async fn get_offer_on_unknown_channel_is_none() {
        let registry = ChannelRegistry::new();
        assert!(registry.get_offer("nowhere").await.is_none());
        // querying must not have created a mailbox
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn submit_candidate_creates_mailbox_on_demand() {
        let registry = ChannelRegistry::new();
        registry
            .submit_candidate("room1", "a", "candidate-1".into())
            .await;
        let mailbox = registry.get("room1").expect("mailbox created");
        assert_eq!(mailbox.candidate_count().await, 1);
    }

    #[tokio::test]
    async fn candidate_log_grows_until_membership_empties() {
        let registry = ChannelRegistry::new();
        let (m1, _rx1) = member("a");
        let (m2, _rx2) = member("b");
        registry.join("room1", m1).await;
        registry.join("room1", m2).await;

        registry.submit_candidate("room1", "a", "c1".into()).await;
        registry.submit_candidate("room1", "b", "c2".into()).await;
        registry.submit_candidate("room1", "a", "c3".into()).await;
        let mailbox = registry.get("room1").unwrap();
        assert_eq!(mailbox.candidate_count().await, 3);

        // exchanging candidates must not purge anything
        registry.remove_connection("a");
        assert!(registry.get("room1").is_some());
        assert_eq!(registry.get("room1").unwrap().candidate_count().await, 3);

        registry.remove_connection("b");
        assert!(registry.get("room1").is_none());
    }

    #[tokio::test]
    async fn forwarding_skips_sender_and_reaches_others() {
        let registry = ChannelRegistry::new();
        let (m1, mut rx1) = member("a");
        let (m2, mut rx2) = member("b");
        registry.join("room1", m1).await;
        registry.join("room1", m2).await;

        registry.submit_offer("room1", "a", "offer".into()).await;
        match rx2.try_recv().unwrap() {
            ServerMessage::OfferReceived { offer, .. } => assert_eq!(offer, "offer"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx1.try_recv().is_err(), "sender must not see its own offer");
    }

    #[tokio::test]
    async fn join_returns_candidate_backlog_in_order() {
        let registry = ChannelRegistry::new();
        let (m1, _rx1) = member("a");
        registry.join("room1", m1).await;
        registry.submit_candidate("room1", "a", "c1".into()).await;
        registry.submit_candidate("room1", "a", "c2".into()).await;

        let (m2, _rx2) = member("b");
        let backlog = registry.join("room1", m2).await;
        assert_eq!(backlog, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn forwarding_to_empty_channel_is_noop() {
        let registry = ChannelRegistry::new();
        let (m1, mut rx1) = member("a");
        registry.join("room1", m1).await;
        registry.submit_answer("room1", "a", "answer".into()).await;
        assert!(rx1.try_recv().is_err());
        assert_eq!(
            registry.get("room1").unwrap().member_count(),
            1,
            "lone member still joined"
        );
    }
}
