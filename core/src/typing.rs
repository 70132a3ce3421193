/// Typing indicators: debounced announcements out, expiring indicators in
use crate::models::ConversationId;
use crate::protocol::{ClientEvent, ServerEvent, TypingAnnounce};
use crate::realtime::ConnectionManager;
use crate::utils::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Default)]
struct Pending {
    generation: u64,
    stop: Option<(TypingAnnounce, JoinHandle<()>)>,
}

/// Sender side. Every keystroke announces `typing:start` and pushes the
/// `typing:stop` back by the debounce window; only the newest timer fires.
#[derive(Clone)]
pub struct TypingDebouncer {
    connection: ConnectionManager,
    debounce: Duration,
    pending: Arc<Mutex<Pending>>,
}

impl TypingDebouncer {
    pub fn new(connection: ConnectionManager, debounce: Duration) -> Self {
        Self {
            connection,
            debounce,
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    pub fn keystroke(&self, announce: TypingAnnounce) {
        send(&self.connection, ClientEvent::TypingStart(announce.clone()));

        let mut pending = lock(&self.pending);
        if let Some((previous, handle)) = pending.stop.take() {
            handle.abort();
            // Switched conversations mid-burst: close out the old indicator now
            if previous != announce {
                send(&self.connection, ClientEvent::TypingStop(previous));
            }
        }

        pending.generation += 1;
        let generation = pending.generation;
        let connection = self.connection.clone();
        let slot = self.pending.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let due = {
                let mut pending = lock(&slot);
                if pending.generation != generation {
                    return;
                }
                pending.stop.take().map(|(announce, _)| announce)
            };
            if let Some(announce) = due {
                send(&connection, ClientEvent::TypingStop(announce));
            }
        });
        pending.stop = Some((announce, handle));
    }

    /// Announce the pending stop right away (e.g. the message was sent)
    pub fn flush(&self) {
        let due = {
            let mut pending = lock(&self.pending);
            pending.generation += 1;
            pending.stop.take()
        };
        if let Some((announce, handle)) = due {
            handle.abort();
            send(&self.connection, ClientEvent::TypingStop(announce));
        }
    }

    /// Forget the pending stop without announcing it
    pub fn cancel(&self) {
        let mut pending = lock(&self.pending);
        pending.generation += 1;
        if let Some((_, handle)) = pending.stop.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending).stop.is_some()
    }
}

fn send(connection: &ConnectionManager, event: ClientEvent) {
    let name = event.name();
    if let Err(e) = connection.emit(event) {
        warn!("Dropped {}: {}", name, e);
    }
}

/// A change in who is typing where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingChange {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub is_typing: bool,
}

/// Receiver side. An indicator lapses after `expiry` without renewal, so a
/// lost `typing:stop` cannot leave it on forever.
#[derive(Debug)]
pub struct TypingTracker {
    local_id: Option<String>,
    expiry: Duration,
    active: HashMap<(ConversationId, String), Instant>,
    sweeping: bool,
}

impl TypingTracker {
    pub fn new(local_id: Option<String>, expiry: Duration) -> Self {
        Self {
            local_id,
            expiry,
            active: HashMap::new(),
            sweeping: false,
        }
    }

    pub fn set_local_identity(&mut self, local_id: Option<String>) {
        self.local_id = local_id;
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Fold a typing event in. Returns the change it caused, if any.
    pub fn apply(&mut self, event: &ServerEvent) -> Option<TypingChange> {
        let (conversation_id, user_id, is_typing) = match event {
            ServerEvent::TypingStart(signal) => (signal.conversation_id.as_ref(), &signal.sender_id, true),
            ServerEvent::TypingStop(signal) => (signal.conversation_id.as_ref(), &signal.sender_id, false),
            ServerEvent::TypingStatus(status) => {
                (status.conversation_id.as_ref(), &status.user_id, status.is_typing)
            }
            _ => return None,
        };
        if self.local_id.as_deref() == Some(user_id.as_str()) {
            return None;
        }
        let conversation_id = match (conversation_id, &self.local_id) {
            (Some(id), _) => id.clone(),
            // Older payloads omit the key; it is implied by the two parties
            (None, Some(local)) => ConversationId::between(local, user_id),
            (None, None) => {
                debug!("Typing event from {} without conversation", user_id);
                return None;
            }
        };

        let changed = if is_typing {
            self.start(conversation_id.clone(), user_id.clone())
        } else {
            self.stop(&conversation_id, user_id)
        };
        changed.then(|| TypingChange {
            conversation_id,
            user_id: user_id.clone(),
            is_typing,
        })
    }

    /// Returns true if the indicator was not already showing
    pub fn start(&mut self, conversation_id: ConversationId, user_id: String) -> bool {
        let now = Instant::now();
        let deadline = now + self.expiry;
        match self.active.insert((conversation_id, user_id), deadline) {
            Some(previous) => previous <= now,
            None => true,
        }
    }

    pub fn stop(&mut self, conversation_id: &ConversationId, user_id: &str) -> bool {
        match self.active.remove(&(conversation_id.clone(), user_id.to_string())) {
            Some(deadline) => deadline > Instant::now(),
            None => false,
        }
    }

    pub fn is_typing(&self, conversation_id: &ConversationId, user_id: &str) -> bool {
        self.active
            .get(&(conversation_id.clone(), user_id.to_string()))
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Users currently typing in a conversation, sorted
    pub fn typing_in(&self, conversation_id: &ConversationId) -> Vec<String> {
        let now = Instant::now();
        let mut users: Vec<String> = self
            .active
            .iter()
            .filter(|((conv, _), deadline)| conv == conversation_id && **deadline > now)
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// True if the caller should start a sweep. At most one sweep runs per
    /// tracker, and only while some indicator is showing.
    pub fn claim_sweep(&mut self) -> bool {
        if self.sweeping || self.active.is_empty() {
            return false;
        }
        self.sweeping = true;
        true
    }

    /// Earliest pending deadline. `None` ends the running sweep.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        let next = self.active.values().min().copied();
        if next.is_none() {
            self.sweeping = false;
        }
        next
    }

    /// Drop lapsed indicators and report them
    pub fn expire(&mut self) -> Vec<TypingChange> {
        let now = Instant::now();
        let mut lapsed = Vec::new();
        self.active.retain(|(conversation_id, user_id), deadline| {
            if *deadline <= now {
                lapsed.push(TypingChange {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.clone(),
                    is_typing: false,
                });
                false
            } else {
                true
            }
        });
        lapsed
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TypingSignal, TypingStatus};

    fn conv() -> ConversationId {
        ConversationId::between("me", "peer")
    }

    fn start(sender: &str) -> ServerEvent {
        ServerEvent::TypingStart(TypingSignal {
            conversation_id: Some(conv()),
            sender_id: sender.to_string(),
        })
    }

    fn stop(sender: &str) -> ServerEvent {
        ServerEvent::TypingStop(TypingSignal {
            conversation_id: Some(conv()),
            sender_id: sender.to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop() {
        let mut tracker = TypingTracker::new(Some("me".to_string()), Duration::from_secs(5));

        let change = tracker.apply(&start("peer")).unwrap();
        assert!(change.is_typing);
        assert!(tracker.is_typing(&conv(), "peer"));
        // Renewal is not a change
        assert!(tracker.apply(&start("peer")).is_none());

        let change = tracker.apply(&stop("peer")).unwrap();
        assert!(!change.is_typing);
        assert!(!tracker.is_typing(&conv(), "peer"));
        assert!(tracker.apply(&stop("peer")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_indicator_lapses_without_renewal() {
        let mut tracker = TypingTracker::new(Some("me".to_string()), Duration::from_secs(5));
        tracker.apply(&start("peer"));

        tokio::time::advance(Duration::from_secs(3)).await;
        tracker.apply(&start("peer"));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(tracker.is_typing(&conv(), "peer"));
        assert!(tracker.expire().is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!tracker.is_typing(&conv(), "peer"));
        let lapsed = tracker.expire();
        assert_eq!(lapsed.len(), 1);
        assert_eq!(lapsed[0].user_id, "peer");
        assert!(tracker.typing_in(&conv()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_pushes_back_next_deadline() {
        let mut tracker = TypingTracker::new(Some("me".to_string()), Duration::from_secs(5));
        assert!(!tracker.claim_sweep());

        tracker.apply(&start("peer"));
        assert!(tracker.claim_sweep());
        // Already running
        assert!(!tracker.claim_sweep());
        let first = tracker.next_deadline().unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        tracker.apply(&start("peer"));
        assert_eq!(tracker.next_deadline(), Some(first + Duration::from_secs(3)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(tracker.expire().len(), 1);
        assert_eq!(tracker.next_deadline(), None);
        // The sweep ended with the last indicator, so the next start claims a new one
        tracker.apply(&start("peer"));
        assert!(tracker.claim_sweep());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_without_conversation_is_derived() {
        let mut tracker = TypingTracker::new(Some("me".to_string()), Duration::from_secs(5));
        let change = tracker
            .apply(&ServerEvent::TypingStatus(TypingStatus {
                user_id: "peer".to_string(),
                is_typing: true,
                conversation_id: None,
            }))
            .unwrap();
        assert_eq!(change.conversation_id, conv());
        assert_eq!(tracker.typing_in(&conv()), vec!["peer".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_echo_is_ignored() {
        let mut tracker = TypingTracker::new(Some("me".to_string()), Duration::from_secs(5));
        assert!(tracker.apply(&start("me")).is_none());
        assert!(tracker.typing_in(&conv()).is_empty());
    }
}
