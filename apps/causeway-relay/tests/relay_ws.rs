//! Integration tests driving the real relay router over real WebSockets.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use causeway_proto::{ClientMessage, ServerMessage};
use causeway_relay::{app, Config, SignalingState};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_relay() -> (SocketAddr, SignalingState) {
    let state = SignalingState::new(&Config::default());
    let router = app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct TestClient {
    write: WsSink,
    read: WsSource,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (stream, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (write, read) = stream.split();
        Self { write, read }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).unwrap();
        self.write.send(Message::Text(json.into())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.read.next())
                .await
                .expect("timed out waiting for relay frame")
                .expect("relay stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_ref()).unwrap();
            }
        }
    }

    async fn join(&mut self, channel: &str) {
        self.send(&ClientMessage::Join {
            channel_name: channel.to_string(),
        })
        .await;
        match self.recv().await {
            ServerMessage::Joined { channel_name } => assert_eq!(channel_name, channel),
            other => panic!("expected joined, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn offer_and_candidates_forward_in_submission_order() {
    let (addr, _state) = start_relay().await;
    let mut c1 = TestClient::connect(addr).await;
    let mut c2 = TestClient::connect(addr).await;
    c1.join("room1").await;
    c2.join("room1").await;

    c1.send(&ClientMessage::SubmitOffer {
        channel_name: "room1".into(),
        offer: "offer-1".into(),
    })
    .await;
    for n in 1..=3 {
        c1.send(&ClientMessage::SubmitIceCandidate {
            channel_name: "room1".into(),
            candidate: format!("cand-{n}"),
        })
        .await;
    }

    // sender sees its acks, in submission order
    assert!(matches!(c1.recv().await, ServerMessage::OfferSubmitted { .. }));
    for _ in 0..3 {
        assert!(matches!(
            c1.recv().await,
            ServerMessage::IceCandidateSubmitted { .. }
        ));
    }

    // the other member observes the forwards, in submission order
    match c2.recv().await {
        ServerMessage::OfferReceived { offer, .. } => assert_eq!(offer, "offer-1"),
        other => panic!("expected offer, got {other:?}"),
    }
    for n in 1..=3 {
        match c2.recv().await {
            ServerMessage::IceCandidateReceived { candidate, .. } => {
                assert_eq!(candidate, format!("cand-{n}"));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn get_offer_is_idempotent_and_tolerates_empty_channels() {
    let (addr, _state) = start_relay().await;
    let mut c1 = TestClient::connect(addr).await;
    c1.join("room1").await;

    // nothing stored yet
    c1.send(&ClientMessage::GetOffer {
        channel_name: "room1".into(),
    })
    .await;
    match c1.recv().await {
        ServerMessage::OfferRetrieved { offer, .. } => assert!(offer.is_none()),
        other => panic!("expected offerRetrieved, got {other:?}"),
    }

    c1.send(&ClientMessage::SubmitOffer {
        channel_name: "room1".into(),
        offer: "offer-1".into(),
    })
    .await;
    assert!(matches!(c1.recv().await, ServerMessage::OfferSubmitted { .. }));

    let mut c2 = TestClient::connect(addr).await;
    c2.join("room1").await;
    for _ in 0..2 {
        c2.send(&ClientMessage::GetOffer {
            channel_name: "room1".into(),
        })
        .await;
        match c2.recv().await {
            ServerMessage::OfferRetrieved { offer, .. } => {
                assert_eq!(offer.as_deref(), Some("offer-1"));
            }
            other => panic!("expected offerRetrieved, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn candidate_log_survives_one_leave_and_purges_on_empty() {
    let (addr, state) = start_relay().await;
    let mut c1 = TestClient::connect(addr).await;
    let mut c2 = TestClient::connect(addr).await;
    c1.join("room1").await;
    c2.join("room1").await;

    for n in 1..=3 {
        c1.send(&ClientMessage::SubmitIceCandidate {
            channel_name: "room1".into(),
            candidate: format!("cand-{n}"),
        })
        .await;
        assert!(matches!(
            c1.recv().await,
            ServerMessage::IceCandidateSubmitted { .. }
        ));
    }
    assert_eq!(
        state.registry().get("room1").unwrap().candidate_count().await,
        3
    );

    drop(c1);
    // one member remains: mailbox and candidate log must survive
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let mailbox = state.registry().get("room1").expect("mailbox retained");
        if mailbox.member_count() == 1 {
            assert_eq!(mailbox.candidate_count().await, 3);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "c1 never removed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    drop(c2);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.registry().get("room1").is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "mailbox never purged after membership emptied"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn candidate_submission_creates_missing_mailbox() {
    let (addr, state) = start_relay().await;
    let mut c1 = TestClient::connect(addr).await;

    // no join, no mailbox; submission must create rather than error
    c1.send(&ClientMessage::SubmitIceCandidate {
        channel_name: "ghost".into(),
        candidate: "cand-1".into(),
    })
    .await;
    assert!(matches!(
        c1.recv().await,
        ServerMessage::IceCandidateSubmitted { .. }
    ));

    let mailbox = state.registry().get("ghost").expect("mailbox created");
    assert_eq!(mailbox.candidate_count().await, 1);
}

#[tokio::test]
async fn late_joiner_receives_candidate_backlog_after_joined_ack() {
    let (addr, _state) = start_relay().await;
    let mut c1 = TestClient::connect(addr).await;
    c1.join("room1").await;
    for n in 1..=2 {
        c1.send(&ClientMessage::SubmitIceCandidate {
            channel_name: "room1".into(),
            candidate: format!("cand-{n}"),
        })
        .await;
        assert!(matches!(
            c1.recv().await,
            ServerMessage::IceCandidateSubmitted { .. }
        ));
    }

    let mut c2 = TestClient::connect(addr).await;
    c2.join("room1").await; // asserts the joined ack came first
    for n in 1..=2 {
        match c2.recv().await {
            ServerMessage::IceCandidateReceived { candidate, .. } => {
                assert_eq!(candidate, format!("cand-{n}"));
            }
            other => panic!("expected replayed candidate, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn heartbeat_sweep_removes_silent_members() {
    let config = Config {
        heartbeat_timeout_seconds: 1,
        heartbeat_sweep_seconds: 1,
        ..Config::default()
    };
    let state = SignalingState::new(&config);
    let router = app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let mut c1 = TestClient::connect(addr).await;
    c1.join("room1").await;

    // never ping; the sweep must drop the membership and purge the mailbox
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.registry().get("room1").is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "silent member never swept"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn ping_pong_and_malformed_frames() {
    let (addr, _state) = start_relay().await;
    let mut c1 = TestClient::connect(addr).await;

    c1.send(&ClientMessage::Ping).await;
    assert!(matches!(c1.recv().await, ServerMessage::Pong));

    c1.write
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    match c1.recv().await {
        ServerMessage::Error { message } => assert!(message.contains("invalid message format")),
        other => panic!("expected error, got {other:?}"),
    }

    // a malformed frame must not kill the connection
    c1.send(&ClientMessage::Ping).await;
    assert!(matches!(c1.recv().await, ServerMessage::Pong));
}

#[tokio::test]
async fn binary_frames_carrying_json_are_accepted() {
    let (addr, _state) = start_relay().await;
    let (stream, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut write, read) = stream.split();
    let json = serde_json::to_string(&ClientMessage::Join {
        channel_name: "room1".into(),
    })
    .unwrap();
    write
        .send(Message::Binary(json.into_bytes().into()))
        .await
        .unwrap();

    let mut client = TestClient { write, read };
    assert!(matches!(client.recv().await, ServerMessage::Joined { .. }));
}
