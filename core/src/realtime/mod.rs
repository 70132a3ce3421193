/// Realtime plumbing: one transport, its outbound queue and the event registry
pub mod connection;
pub mod dispatcher;
pub mod queue;
pub mod transport;

pub use connection::{Backoff, ConnectionId, ConnectionManager, ConnectionState};
pub use dispatcher::{Dispatcher, Event, EventKind, Subscription};
pub use queue::{OutboundQueue, PendingEmission};
pub use transport::{Connector, Link, PendingWrite, WsConnector};
