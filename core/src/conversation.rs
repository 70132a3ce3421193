/// Conversation reconciliation.
///
/// REST history and live events race each other. Every conversation moves
/// `Unloaded -> Loading -> Loaded`; while `Loading`, live events for it are
/// parked and replayed on top of the fetched history, so the merge rules
/// below decide the outcome no matter which side arrives first:
///
/// * unknown id: insert in `createdAt` order
/// * known id: no-op for a receive, full replace for a reaction update
/// * deletion of an absent id: no-op
/// * event for a conversation with no view: ignored

use crate::models::{ConversationId, Message};
use crate::protocol::ServerEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Messages of one conversation, oldest first, unique by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation_id: ConversationId,
    messages: Vec<Message>,
}

impl ConversationView {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.get(message_id).is_some()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }

    /// Take a fetched history as the new content. Order is normalised and
    /// repeated ids keep their first occurrence.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        for message in messages {
            self.insert(message);
        }
    }

    /// Insert in chronological position, after any message with the same
    /// timestamp. Returns false if the id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    pub fn remove(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        self.messages.len() != before
    }

    /// Swap in the server's copy of a message. Absent ids are ignored.
    pub fn replace(&mut self, message: Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(slot) => {
                *slot = message;
                true
            }
            None => false,
        }
    }

    /// Returns how many messages flipped to read
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for message in self.messages.iter_mut().filter(|m| !m.read) {
            message.read = true;
            changed += 1;
        }
        changed
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadPhase {
    Unloaded,
    Loading,
    Loaded,
}

/// Proof of which history request a response answers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadTicket {
    pub conversation_id: ConversationId,
    token: u64,
}

/// Follow-up work the caller has to perform after applying an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The open conversation has unseen messages: mark read over REST and
    /// announce `message:read`
    AcknowledgeRead { conversation_id: ConversationId },
    /// A message arrived for a conversation that is not open
    CountUnread { conversation_id: ConversationId },
}

#[derive(Debug)]
struct Entry {
    phase: LoadPhase,
    token: u64,
    view: ConversationView,
    /// Live events that arrived while loading
    backlog: Vec<ServerEvent>,
    last_error: Option<String>,
}

impl Entry {
    fn new(conversation_id: ConversationId) -> Self {
        Self {
            phase: LoadPhase::Unloaded,
            token: 0,
            view: ConversationView::new(conversation_id),
            backlog: Vec::new(),
            last_error: None,
        }
    }
}

/// Per-conversation views plus the notion of which one is open
#[derive(Debug, Default)]
pub struct Reconciler {
    local_id: Option<String>,
    active: Option<ConversationId>,
    entries: HashMap<ConversationId, Entry>,
    next_token: u64,
}

impl Reconciler {
    pub fn new(local_id: Option<String>) -> Self {
        Self {
            local_id,
            ..Self::default()
        }
    }

    pub fn set_local_identity(&mut self, local_id: Option<String>) {
        self.local_id = local_id;
    }

    pub fn local_identity(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Make `conversation_id` the open conversation and start (re)loading it.
    ///
    /// A load still in flight for the previously open conversation is
    /// abandoned; its response will be rejected.
    pub fn open(&mut self, conversation_id: ConversationId) -> LoadTicket {
        if let Some(previous) = self.active.take() {
            if previous != conversation_id {
                if let Some(entry) = self.entries.get_mut(&previous) {
                    if entry.phase == LoadPhase::Loading {
                        entry.phase = LoadPhase::Unloaded;
                        entry.backlog.clear();
                    }
                }
            }
        }

        self.next_token += 1;
        let token = self.next_token;
        let entry = self
            .entries
            .entry(conversation_id.clone())
            .or_insert_with(|| Entry::new(conversation_id.clone()));
        entry.phase = LoadPhase::Loading;
        entry.token = token;
        entry.backlog.clear();
        entry.last_error = None;

        debug!("Loading conversation {} (ticket {})", conversation_id, token);
        self.active = Some(conversation_id.clone());
        LoadTicket {
            conversation_id,
            token,
        }
    }

    /// Leave the open conversation (views are kept)
    pub fn close(&mut self) {
        if let Some(previous) = self.active.take() {
            if let Some(entry) = self.entries.get_mut(&previous) {
                if entry.phase == LoadPhase::Loading {
                    entry.phase = LoadPhase::Unloaded;
                    entry.backlog.clear();
                }
            }
        }
    }

    fn is_current(&self, ticket: &LoadTicket) -> bool {
        self.active.as_ref() == Some(&ticket.conversation_id)
            && self
                .entries
                .get(&ticket.conversation_id)
                .is_some_and(|e| e.phase == LoadPhase::Loading && e.token == ticket.token)
    }

    /// Apply a history response. Returns `None` when the ticket is stale.
    pub fn apply_history(&mut self, ticket: &LoadTicket, messages: Vec<Message>) -> Option<Vec<Effect>> {
        if !self.is_current(ticket) {
            debug!(
                "Discarding stale history for {} (ticket {})",
                ticket.conversation_id, ticket.token
            );
            return None;
        }
        let entry = self.entries.get_mut(&ticket.conversation_id)?;
        entry.view.replace_all(messages);
        entry.phase = LoadPhase::Loaded;
        let backlog = std::mem::take(&mut entry.backlog);
        let unread = self.has_unread_from_peer(&ticket.conversation_id);

        let mut effects = Vec::new();
        if unread {
            effects.push(Effect::AcknowledgeRead {
                conversation_id: ticket.conversation_id.clone(),
            });
        }
        for event in backlog {
            for effect in self.apply(&event) {
                if !effects.contains(&effect) {
                    effects.push(effect);
                }
            }
        }
        Some(effects)
    }

    /// A history fetch failed: the conversation ends up loaded and empty,
    /// with the error kept for display. Reopening retries.
    pub fn fail_history(&mut self, ticket: &LoadTicket, error: &str) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        warn!("History for {} failed: {}", ticket.conversation_id, error);
        let Some(entry) = self.entries.get_mut(&ticket.conversation_id) else {
            return false;
        };
        entry.view.clear();
        entry.phase = LoadPhase::Loaded;
        entry.last_error = Some(error.to_string());
        let backlog = std::mem::take(&mut entry.backlog);
        for event in backlog {
            let _ = self.apply(&event);
        }
        true
    }

    fn has_unread_from_peer(&self, conversation_id: &ConversationId) -> bool {
        let local = self.local_id.as_deref();
        self.entries.get(conversation_id).is_some_and(|e| {
            e.view
                .messages()
                .iter()
                .any(|m| !m.read && Some(m.sender_id.as_str()) != local)
        })
    }

    /// Fold one live event into the views
    pub fn apply(&mut self, event: &ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::MessageReceive(message) => self.receive(message, event),
            ServerEvent::MessageReadConfirm(confirm) => {
                self.with_loaded(&confirm.conversation_id, event, |view| {
                    let changed = view.mark_all_read();
                    debug!("{} messages read in {}", changed, view.conversation_id);
                });
                Vec::new()
            }
            ServerEvent::MessageDeleted(removal) => {
                self.with_loaded(&removal.conversation_id, event, |view| {
                    if !view.remove(&removal.message_id) {
                        debug!("Deleted message {} not in view", removal.message_id);
                    }
                });
                Vec::new()
            }
            ServerEvent::MessageReact(update) => {
                self.with_loaded(&update.conversation_id, event, |view| {
                    view.replace(update.message.clone());
                });
                Vec::new()
            }
            ServerEvent::ChatCleared(cleared) => {
                self.with_loaded(&cleared.conversation_id, event, ConversationView::clear);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn receive(&mut self, message: &Message, event: &ServerEvent) -> Vec<Effect> {
        let conversation_id = &message.conversation_id;
        let from_peer = self.local_id.as_deref() != Some(message.sender_id.as_str());

        if self.active.as_ref() != Some(conversation_id) {
            debug!("Message {} for inactive conversation {}", message.id, conversation_id);
            return if from_peer {
                vec![Effect::CountUnread {
                    conversation_id: conversation_id.clone(),
                }]
            } else {
                Vec::new()
            };
        }

        let Some(entry) = self.entries.get_mut(conversation_id) else {
            return Vec::new();
        };
        match entry.phase {
            LoadPhase::Loading => {
                entry.backlog.push(event.clone());
                Vec::new()
            }
            LoadPhase::Loaded => {
                if entry.view.insert(message.clone()) && from_peer && !message.read {
                    vec![Effect::AcknowledgeRead {
                        conversation_id: conversation_id.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }
            LoadPhase::Unloaded => Vec::new(),
        }
    }

    /// Run `mutate` against a loaded view, park the event if the view is
    /// loading, drop it otherwise
    fn with_loaded<F>(&mut self, conversation_id: &ConversationId, event: &ServerEvent, mutate: F)
    where
        F: FnOnce(&mut ConversationView),
    {
        match self.entries.get_mut(conversation_id) {
            Some(entry) if entry.phase == LoadPhase::Loaded => mutate(&mut entry.view),
            Some(entry) if entry.phase == LoadPhase::Loading => entry.backlog.push(event.clone()),
            _ => debug!("Ignoring {} for unloaded conversation {}", event.name(), conversation_id),
        }
    }

    /// Record a message the REST API just persisted for us
    pub fn record_sent(&mut self, message: Message) -> bool {
        match self.entries.get_mut(&message.conversation_id) {
            Some(entry) => entry.view.insert(message),
            None => false,
        }
    }

    pub fn record_deleted(&mut self, conversation_id: &ConversationId, message_id: &str) -> bool {
        self.entries
            .get_mut(conversation_id)
            .is_some_and(|e| e.view.remove(message_id))
    }

    pub fn record_reaction(&mut self, message: Message) -> bool {
        match self.entries.get_mut(&message.conversation_id) {
            Some(entry) => entry.view.replace(message),
            None => false,
        }
    }

    pub fn record_cleared(&mut self, conversation_id: &ConversationId) {
        if let Some(entry) = self.entries.get_mut(conversation_id) {
            entry.view.clear();
        }
    }

    /// Our own read acknowledgement went through
    pub fn record_read(&mut self, conversation_id: &ConversationId) -> usize {
        self.entries
            .get_mut(conversation_id)
            .map(|e| e.view.mark_all_read())
            .unwrap_or(0)
    }

    pub fn phase(&self, conversation_id: &ConversationId) -> LoadPhase {
        self.entries
            .get(conversation_id)
            .map(|e| e.phase)
            .unwrap_or(LoadPhase::Unloaded)
    }

    pub fn view(&self, conversation_id: &ConversationId) -> Option<&ConversationView> {
        self.entries.get(conversation_id).map(|e| &e.view)
    }

    pub fn active_view(&self) -> Option<&ConversationView> {
        self.active.as_ref().and_then(|id| self.view(id))
    }

    pub fn last_error(&self, conversation_id: &ConversationId) -> Option<&str> {
        self.entries
            .get(conversation_id)
            .and_then(|e| e.last_error.as_deref())
    }
}
