//! Client side of the causeway handshake: the relay connection, the
//! negotiation engine that drives one offer/answer/candidate exchange, and
//! the connection state machine that supervises session generations and
//! reconnects after peer loss.
//!
//! The peer transport itself is pluggable behind the traits in
//! [`transport`]; [`mock`] provides the in-memory implementation used by
//! tests and simulations.

pub mod connection;
pub mod mock;
pub mod negotiation;
pub mod relay;
pub mod router;
pub mod transport;

pub use connection::{
    ConnectError, ConnectionCallbacks, ConnectionStage, Connector, ConnectorConfig,
};
pub use negotiation::{EngineRole, NegotiationEngine, NegotiationError};
pub use relay::{RelayClient, RelayError, RelayEvent, RelaySettings};
pub use router::ChannelRouter;
pub use transport::{
    DataChannel, MessageCallback, PeerTransport, PeerTransportFactory, PeerTransportState,
    TransportError, TransportEvent,
};
