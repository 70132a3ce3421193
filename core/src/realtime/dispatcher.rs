/// Typed publish/subscribe over the single realtime connection.
///
/// Subscribers register against an [`EventKind`] and get back a
/// [`Subscription`] handle. Removing a subscriber always goes through that
/// handle, so one component can never wipe out another component's
/// subscribers for the same event.

use super::connection::ConnectionId;
use crate::protocol::ServerEvent;
use crate::utils::lock;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Everything a subscriber can observe: connection lifecycle plus server pushes
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected { connection_id: ConnectionId },
    Disconnected { reason: String },
    ConnectError { message: String },
    ReconnectAttempt { attempt: u32 },
    ReconnectFailed,
    Server(ServerEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected { .. } => EventKind::Connect,
            Event::Disconnected { .. } => EventKind::Disconnect,
            Event::ConnectError { .. } => EventKind::ConnectError,
            Event::ReconnectAttempt { .. } => EventKind::ReconnectAttempt,
            Event::ReconnectFailed => EventKind::ReconnectFailed,
            Event::Server(server) => match server {
                ServerEvent::UsersOnline(_) => EventKind::UsersOnline,
                ServerEvent::MessageReceive(_) => EventKind::MessageReceive,
                ServerEvent::MessageReadConfirm(_) => EventKind::MessageReadConfirm,
                ServerEvent::MessageDeleted(_) => EventKind::MessageDeleted,
                ServerEvent::MessageReact(_) => EventKind::MessageReact,
                ServerEvent::ChatCleared(_) => EventKind::ChatCleared,
                ServerEvent::TypingStart(_) => EventKind::TypingStart,
                ServerEvent::TypingStop(_) => EventKind::TypingStop,
                ServerEvent::TypingStatus(_) => EventKind::TypingStatus,
                ServerEvent::UserUpdated(_) => EventKind::UserUpdated,
                ServerEvent::PostUpdated(_) => EventKind::PostUpdated,
                ServerEvent::NotificationNew(_) => EventKind::NotificationNew,
            },
        }
    }
}

impl From<ServerEvent> for Event {
    fn from(event: ServerEvent) -> Self {
        Event::Server(event)
    }
}

/// Tag of an [`Event`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    ReconnectAttempt,
    ReconnectFailed,
    UsersOnline,
    MessageReceive,
    MessageReadConfirm,
    MessageDeleted,
    MessageReact,
    ChatCleared,
    TypingStart,
    TypingStop,
    TypingStatus,
    UserUpdated,
    PostUpdated,
    NotificationNew,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::ConnectError,
        EventKind::ReconnectAttempt,
        EventKind::ReconnectFailed,
        EventKind::UsersOnline,
        EventKind::MessageReceive,
        EventKind::MessageReadConfirm,
        EventKind::MessageDeleted,
        EventKind::MessageReact,
        EventKind::ChatCleared,
        EventKind::TypingStart,
        EventKind::TypingStop,
        EventKind::TypingStatus,
        EventKind::UserUpdated,
        EventKind::PostUpdated,
        EventKind::NotificationNew,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::ConnectError => "connect_error",
            EventKind::ReconnectAttempt => "reconnect_attempt",
            EventKind::ReconnectFailed => "reconnect_failed",
            EventKind::UsersOnline => "users:online",
            EventKind::MessageReceive => "message:receive",
            EventKind::MessageReadConfirm => "message:read:confirm",
            EventKind::MessageDeleted => "message:deleted",
            EventKind::MessageReact => "message:react",
            EventKind::ChatCleared => "chat:cleared",
            EventKind::TypingStart => "typing:start",
            EventKind::TypingStop => "typing:stop",
            EventKind::TypingStatus => "typing:status",
            EventKind::UserUpdated => "user:updated",
            EventKind::PostUpdated => "post:updated",
            EventKind::NotificationNew => "notification:new",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle returned by [`Dispatcher::on`]; pass it back to [`Dispatcher::off`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[must_use = "dropping the handle makes the subscription impossible to remove"]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Callback)>>,
}

/// Multi-subscriber event registry. Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        debug!("Subscribed #{} to {}", id, kind);
        Subscription { kind, id }
    }

    /// Remove exactly one subscriber. Returns false if it was already gone.
    pub fn off(&self, subscription: &Subscription) -> bool {
        let mut registry = lock(&self.registry);
        let Some(handlers) = registry.handlers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.handlers.remove(&subscription.kind);
        }
        removed
    }

    /// Invoke every subscriber of the event's kind. Returns how many ran cleanly.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe. A panicking callback is logged and does not stop the rest.
    pub fn dispatch(&self, event: &Event) -> usize {
        let kind = event.kind();
        let callbacks: Vec<Callback> = {
            let registry = lock(&self.registry);
            match registry.handlers.get(&kind) {
                Some(handlers) => handlers.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("Subscriber for {} panicked", kind),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.registry)
            .handlers
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        lock(&self.registry).handlers.values().map(Vec::len).sum()
    }

    /// Drop every subscriber. Only for tearing down the whole connection.
    pub(crate) fn clear(&self) {
        lock(&self.registry).handlers.clear();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.total_subscribers())
            .finish()
    }
}
