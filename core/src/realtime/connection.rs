/// Connection manager: owns the one long-lived realtime transport.
///
/// Construct one [`ConnectionManager`] at application start and hand clones
/// to every component that needs live events. `connect` lazily opens the
/// transport, a background task keeps it open (reconnecting with capped
/// exponential backoff), and emissions issued while it is down wait in the
/// outbound queue until the next open.

use super::dispatcher::{Dispatcher, Event, EventKind, Subscription};
use super::queue::{OutboundQueue, PendingEmission};
use super::transport::{Connector, Link, WsConnector};
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::utils::lock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport, or closed on request, or gave up reconnecting
    Disconnected,
    /// Opening, or waiting to retry
    Connecting,
    /// Open; emissions go straight out
    Connected,
}

/// Identity of one transport handle. Survives `disconnect`/`connect`,
/// replaced after `force_destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reconnect delay schedule: `min(base * 2^(attempt-1), max)`, jittered
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    randomization_factor: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, randomization_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            randomization_factor: randomization_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.reconnection_delay,
            config.reconnection_delay_max,
            config.randomization_factor,
        )
    }

    /// Delay before attempt `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.randomization_factor <= 0.0 {
            return delay;
        }
        let ms = delay.as_millis() as f64;
        let factor = self.randomization_factor;
        let deviation = rand::thread_rng().gen_range(-factor..=factor) * ms;
        Duration::from_millis((ms + deviation).max(0.0) as u64).min(self.max)
    }
}

enum Command {
    Send(ClientEvent),
    Close,
}

enum SessionEnd {
    /// Closed on request or superseded; the task must exit
    Closed,
    /// Lost the transport; reconnect
    Dropped(String),
}

struct Session {
    id: ConnectionId,
    /// `None` once closed on request or after giving up
    commands: Option<mpsc::UnboundedSender<Command>>,
}

struct Core {
    state: ConnectionState,
    queue: OutboundQueue,
    session: Option<Session>,
    identity: Option<String>,
    /// Bumped whenever a session task is started or told to stop. A task
    /// only touches shared state while its own run is still current.
    run: u64,
}

struct Inner {
    config: Config,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Cheap to clone; clones share the transport, queue and subscribers.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let core = Core {
            state: ConnectionState::Disconnected,
            queue: OutboundQueue::new(config.outbound_queue_capacity),
            session: None,
            identity: None,
            run: 0,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                dispatcher: Dispatcher::new(),
                core: Mutex::new(core),
                state_tx,
            }),
        }
    }

    /// Manager backed by the WebSocket transport
    pub fn with_websocket(config: Config) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    /// Open the transport if there is none, otherwise return the live one.
    ///
    /// With an identity, `user:join` is announced on every open. A new
    /// identity given to an already-open connection is announced at once.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, identity: Option<&str>) -> ConnectionId {
        let mut core = lock(&self.inner.core);

        let identity_changed = match identity {
            Some(id) if core.identity.as_deref() != Some(id) => {
                core.identity = Some(id.to_string());
                true
            }
            _ => false,
        };

        if let Some(session) = &core.session {
            if let Some(commands) = &session.commands {
                if identity_changed && core.state == ConnectionState::Connected {
                    if let Some(identity) = core.identity.clone() {
                        let _ = commands.send(Command::Send(ClientEvent::Join(identity)));
                    }
                }
                return session.id;
            }
        }

        let id = core
            .session
            .as_ref()
            .map(|s| s.id)
            .unwrap_or_else(ConnectionId::new);
        core.run += 1;
        let run = core.run;
        let (tx, rx) = mpsc::unbounded_channel();
        core.session = Some(Session {
            id,
            commands: Some(tx),
        });
        core.state = ConnectionState::Connecting;
        self.inner.state_tx.send_replace(ConnectionState::Connecting);
        drop(core);

        info!("Opening realtime connection {} to {}", id, self.inner.config.socket_url);
        tokio::spawn(run_session(self.inner.clone(), id, run, rx));
        id
    }

    /// Close the transport but keep the handle and every subscriber, so a
    /// later `connect` re-opens under the same id.
    pub fn disconnect(&self) {
        {
            let mut core = lock(&self.inner.core);
            let Some(commands) = core.session.as_mut().and_then(|s| s.commands.take()) else {
                return;
            };
            core.run += 1;
            let _ = commands.send(Command::Close);
            core.state = ConnectionState::Disconnected;
            self.inner.state_tx.send_replace(ConnectionState::Disconnected);
        }
        info!("Realtime connection closed on request");
        self.inner.dispatcher.dispatch(&Event::Disconnected {
            reason: "client disconnect".to_string(),
        });
    }

    /// Discard the transport handle entirely. Subscribers go with it; the
    /// next `connect` creates a new handle. Pending emissions are kept.
    pub fn force_destroy(&self) {
        self.disconnect();
        let pending = {
            let mut core = lock(&self.inner.core);
            core.session = None;
            core.identity = None;
            core.queue.len()
        };
        self.inner.dispatcher.clear();
        info!("Realtime connection destroyed ({} emissions still pending)", pending);
    }

    /// Send now if open, otherwise queue for the next open.
    ///
    /// With no transport at all this starts one (without identity). Fails
    /// only when the queue is full.
    pub fn emit(&self, event: ClientEvent) -> Result<()> {
        let has_session = lock(&self.inner.core).session.is_some();
        if !has_session {
            debug!("No connection yet, connecting before {}", event.name());
            self.connect(None);
        }

        let mut core = lock(&self.inner.core);
        let event = if core.state == ConnectionState::Connected {
            match core.session.as_ref().and_then(|s| s.commands.clone()) {
                Some(commands) => match commands.send(Command::Send(event)) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(Command::Send(event))) => event,
                    Err(mpsc::error::SendError(Command::Close)) => return Ok(()),
                },
                None => event,
            }
        } else {
            event
        };

        debug!("Not connected, queueing {}", event.name());
        core.queue.push(event)
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(kind, callback)
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.inner.dispatcher.off(subscription)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.core).state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.inner.core).session.as_ref().map(|s| s.id)
    }

    pub fn identity(&self) -> Option<String> {
        lock(&self.inner.core).identity.clone()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.core).queue.len()
    }

    pub fn pending_names(&self) -> Vec<&'static str> {
        lock(&self.inner.core).queue.pending_names()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Background task driving one run of a connection: open, serve, reconnect.
async fn run_session(
    inner: Arc<Inner>,
    id: ConnectionId,
    run: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let backoff = Backoff::from_config(&inner.config);
    let mut attempt: u32 = 0;

    loop {
        if !inner.set_state(run, ConnectionState::Connecting) {
            return;
        }

        let opened = timeout(
            inner.config.connect_timeout,
            inner.connector.open(&inner.config.socket_url),
        )
        .await;

        let failure = match opened {
            Ok(Ok(link)) => {
                attempt = 0;
                match inner.serve(id, run, link, &mut commands).await {
                    SessionEnd::Closed => return,
                    SessionEnd::Dropped(reason) => reason,
                }
            }
            Ok(Err(e)) => {
                warn!("Connection {} failed to open: {}", id, e);
                if inner.is_current(run) {
                    inner.dispatcher.dispatch(&Event::ConnectError {
                        message: e.to_string(),
                    });
                }
                e.to_string()
            }
            Err(_) => {
                let message = format!(
                    "connect timed out after {:?}",
                    inner.config.connect_timeout
                );
                warn!("Connection {}: {}", id, message);
                if inner.is_current(run) {
                    inner.dispatcher.dispatch(&Event::ConnectError {
                        message: message.clone(),
                    });
                }
                message
            }
        };

        attempt += 1;
        if attempt > inner.config.reconnection_attempts {
            if inner.give_up(run) {
                error!(
                    "Connection {}: giving up after {} reconnect attempts ({})",
                    id,
                    attempt - 1,
                    failure
                );
                inner.dispatcher.dispatch(&Event::ReconnectFailed);
            }
            return;
        }

        if !inner.is_current(run) {
            return;
        }
        let delay = backoff.delay(attempt);
        info!("Connection {}: reconnect attempt {} in {:?}", id, attempt, delay);
        inner
            .dispatcher
            .dispatch(&Event::ReconnectAttempt { attempt });

        if !inner.wait(run, delay, &mut commands).await {
            return;
        }
    }
}

impl Inner {
    fn is_current(&self, run: u64) -> bool {
        lock(&self.core).run == run
    }

    fn set_state(&self, run: u64, state: ConnectionState) -> bool {
        let mut core = lock(&self.core);
        if core.run != run {
            return false;
        }
        core.state = state;
        self.state_tx.send_replace(state);
        true
    }

    /// Mark Connected and take the backlog in one step, so every emission
    /// either lands in the backlog or goes through the command channel.
    fn open_gate(&self, run: u64) -> Option<(Vec<PendingEmission>, Option<String>)> {
        let mut core = lock(&self.core);
        if core.run != run {
            return None;
        }
        core.state = ConnectionState::Connected;
        self.state_tx.send_replace(ConnectionState::Connected);
        Some((core.queue.drain(), core.identity.clone()))
    }

    /// Transport lost: stop direct sends and park everything unsent at the
    /// head of the queue, oldest first. Returns false if this run is over.
    fn fail_over(
        &self,
        run: u64,
        mut unsent: Vec<PendingEmission>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let mut core = lock(&self.core);
        if core.run != run {
            return false;
        }
        core.state = ConnectionState::Connecting;
        self.state_tx.send_replace(ConnectionState::Connecting);

        while let Ok(command) = commands.try_recv() {
            if let Command::Send(event) = command {
                unsent.push(PendingEmission::new(event));
            }
        }
        if !unsent.is_empty() {
            warn!("Re-queueing {} unsent emissions", unsent.len());
            core.queue.requeue_front(unsent);
        }
        true
    }

    fn give_up(&self, run: u64) -> bool {
        let mut core = lock(&self.core);
        if core.run != run {
            return false;
        }
        core.state = ConnectionState::Disconnected;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if let Some(session) = core.session.as_mut() {
            session.commands = None;
        }
        true
    }

    async fn serve(
        &self,
        id: ConnectionId,
        run: u64,
        mut link: Link,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let Some((backlog, identity)) = self.open_gate(run) else {
            return SessionEnd::Closed;
        };
        info!("Connection {} open", id);

        if !backlog.is_empty() {
            debug!("Flushing {} pending emissions", backlog.len());
        }
        let mut unsent = Vec::new();
        for entry in backlog {
            if let Err(entry) = write(&link, entry).await {
                unsent.push(entry);
            }
        }
        if let Some(identity) = identity {
            // A failed join is repeated on the next open anyway
            let _ = write(&link, PendingEmission::new(ClientEvent::Join(identity))).await;
        }
        if !unsent.is_empty() {
            return self.drop_session(run, unsent, commands, "transport closed during flush");
        }

        self.dispatcher.dispatch(&Event::Connected { connection_id: id });

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(event)) => {
                        if let Err(entry) = write(&link, PendingEmission::new(event)).await {
                            return self.drop_session(run, vec![entry], commands, "transport closed while sending");
                        }
                    }
                    Some(Command::Close) | None => {
                        debug!("Connection {} closing transport", id);
                        return SessionEnd::Closed;
                    }
                },
                frame = link.recv() => match frame {
                    Some(text) => self.handle_frame(&text),
                    None => {
                        return self.drop_session(run, Vec::new(), commands, "transport closed by server");
                    }
                },
            }
        }
    }

    fn drop_session(
        &self,
        run: u64,
        unsent: Vec<PendingEmission>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        reason: &str,
    ) -> SessionEnd {
        warn!("Connection lost: {}", reason);
        if !self.fail_over(run, unsent, commands) {
            return SessionEnd::Closed;
        }
        self.dispatcher.dispatch(&Event::Disconnected {
            reason: reason.to_string(),
        });
        SessionEnd::Dropped(reason.to_string())
    }

    fn handle_frame(&self, text: &str) {
        match ServerEvent::decode(text) {
            Ok(event) => {
                let name = event.name();
                let delivered = self.dispatcher.dispatch(&Event::Server(event));
                debug!("Received {} ({} subscribers)", name, delivered);
            }
            Err(e) => warn!("Ignoring frame: {}", e),
        }
    }

    /// Sleep out a reconnect delay. Returns false if told to stop meanwhile.
    async fn wait(
        &self,
        run: u64,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return self.is_current(run),
                command = commands.recv() => match command {
                    Some(Command::Send(event)) => {
                        let mut core = lock(&self.core);
                        if let Err(e) = core.queue.push(event) {
                            error!("Emission lost while reconnecting: {}", e);
                        }
                    }
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }
}

/// Write one emission. Encoding failures are logged and skipped; a closed
/// transport hands the entry back so it can be re-queued.
async fn write(link: &Link, entry: PendingEmission) -> std::result::Result<(), PendingEmission> {
    let frame = match entry.event.encode() {
        Ok(frame) => frame,
        Err(e) => {
            error!("Skipping {}: {}", entry.name(), e);
            return Ok(());
        }
    };
    match link.send(frame).await {
        Ok(()) => {
            debug!("Emitted {}", entry.name());
            Ok(())
        }
        Err(e) => {
            warn!("Failed to emit {}: {}", entry.name(), e);
            Err(entry)
        }
    }
}
