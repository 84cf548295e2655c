//! blechat-services: link sessions, the session table, listeners, message
//! routing, and the chat node that wires them around a transport.

pub mod link;
pub mod listener;
pub mod loopback;
pub mod message_store;
pub mod node;
pub mod router;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use link::{LinkSession, LinkState, Role, SendError, SessionError};
pub use listener::{ConnectError, ListenerErrors, ListenerFailure, ListenerManager};
pub use loopback::{LoopbackAir, LoopbackRadio};
pub use message_store::MessageStore;
pub use node::{ChatNode, EventPump, NodeConfig, NodeError};
pub use router::{Inbound, InboundError, MessageRouter};
pub use session::{SessionRef, SessionSnapshot, SessionTable};
pub use transport::{
    event_channel, ConnectionState, EventReceiver, EventSender, ListenerHandle, PeerDescriptor,
    Transport, TransportError, TransportEvent, TransportHandle, WriteError,
};
