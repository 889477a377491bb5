//! In-memory log of the open conversation.
//!
//! The log is a view cache: it is rebuilt from history when a conversation
//! opens and discarded when another one does. Messages are deduplicated by
//! server id when known and by correlation id otherwise, which is what lets
//! the realtime channel and the polling fallback deliver the same message
//! without it showing up twice.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{ConversationScope, CorrelationId, PeerKey, ReadState, ServerMessageId};
use tracing::{debug, warn};

use crate::error::ChatError;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub server_id: Option<ServerMessageId>,
    pub correlation_id: Option<CorrelationId>,
    pub sender: PeerKey,
    pub scope: ConversationScope,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub read_state: ReadState,
    /// Set when submission failed; cleared by a successful resend or echo.
    pub failure: Option<String>,
}

impl Message {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    fn advance(&mut self, state: ReadState) -> bool {
        if state > self.read_state {
            self.read_state = state;
            true
        } else {
            false
        }
    }

    fn is_optimistic(&self) -> bool {
        self.read_state <= ReadState::Sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Confirmed { index: usize },
    Appended { index: usize },
    /// Already present; `advanced` tells whether its read state moved.
    Duplicate { index: usize, advanced: bool },
    OutOfScope,
}

impl ReconcileOutcome {
    pub fn changed_log(self) -> bool {
        match self {
            Self::Confirmed { .. } | Self::Appended { .. } => true,
            Self::Duplicate { advanced, .. } => advanced,
            Self::OutOfScope => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageLog {
    scope: Option<ConversationScope>,
    self_key: PeerKey,
    entries: Vec<Message>,
    by_server_id: HashMap<ServerMessageId, usize>,
    by_correlation: HashMap<CorrelationId, usize>,
}

impl MessageLog {
    pub fn new(self_key: PeerKey) -> Self {
        Self {
            self_key,
            ..Self::default()
        }
    }

    pub fn set_self_key(&mut self, self_key: PeerKey) {
        self.self_key = self_key;
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_correlation(&self, correlation_id: &CorrelationId) -> Option<&Message> {
        self.by_correlation
            .get(correlation_id)
            .map(|index| &self.entries[*index])
    }

    pub fn by_server_id(&self, server_id: ServerMessageId) -> Option<&Message> {
        self.by_server_id
            .get(&server_id)
            .map(|index| &self.entries[*index])
    }

    pub fn reset(&mut self, scope: Option<ConversationScope>) {
        self.scope = scope;
        self.entries.clear();
        self.by_server_id.clear();
        self.by_correlation.clear();
    }

    /// Replaces the log with `history` sorted by creation time. Entries that
    /// arrived since the conversation opened and that the history does not
    /// know about yet are kept after it; entries it does know keep the more
    /// advanced read state. Returns `false` and leaves the log alone when
    /// `scope` is no longer the open conversation.
    pub fn load_history(&mut self, scope: &ConversationScope, mut history: Vec<Message>) -> bool {
        if self.scope.as_ref() != Some(scope) {
            debug!(%scope, "history: discarding stale load");
            return false;
        }

        history.sort_by_key(|message| message.created_at);
        let local: Vec<Message> = self.entries.drain(..).collect();
        self.by_server_id.clear();
        self.by_correlation.clear();

        for message in history {
            if self.find_existing(&message).is_none() {
                self.push_indexed(message);
            }
        }
        for message in local {
            match self.find_existing(&message) {
                Some(index) => {
                    if let Some(server_id) = message.server_id {
                        self.assign_server_id(index, server_id);
                    }
                    self.entries[index].advance(message.read_state);
                }
                None => {
                    self.push_indexed(message);
                }
            }
        }
        true
    }

    pub fn push_pending(&mut self, text: &str) -> Result<Message, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let scope = self
            .scope
            .clone()
            .ok_or_else(|| ChatError::Addressing("no conversation is open".into()))?;
        if !scope.is_addressable() {
            return Err(ChatError::Addressing(format!("{scope} has no address")));
        }

        let message = Message {
            server_id: None,
            correlation_id: Some(CorrelationId::generate()),
            sender: self.self_key.clone(),
            scope,
            text: text.to_string(),
            created_at: Utc::now(),
            read_state: ReadState::Pending,
            failure: None,
        };
        self.push_indexed(message.clone());
        Ok(message)
    }

    /// Records that a submission went out, attaching the server id when the
    /// path that carried it returned one.
    pub fn acknowledge(
        &mut self,
        correlation_id: &CorrelationId,
        server_id: Option<ServerMessageId>,
    ) -> bool {
        let Some(index) = self.by_correlation.get(correlation_id).copied() else {
            return false;
        };
        let mut changed = false;
        if let Some(server_id) = server_id {
            changed |= self.assign_server_id(index, server_id);
        }
        let entry = &mut self.entries[index];
        changed |= entry.failure.take().is_some();
        changed |= entry.advance(ReadState::Sent);
        changed
    }

    pub fn mark_failed(&mut self, correlation_id: &CorrelationId, reason: impl Into<String>) -> bool {
        let Some(index) = self.by_correlation.get(correlation_id).copied() else {
            return false;
        };
        let entry = &mut self.entries[index];
        if !entry.is_optimistic() {
            return false;
        }
        entry.failure = Some(reason.into());
        true
    }

    /// Clears a failure annotation ahead of a manual resend and returns the
    /// entry to resubmit.
    pub fn take_failed(&mut self, correlation_id: &CorrelationId) -> Option<Message> {
        let index = self.by_correlation.get(correlation_id).copied()?;
        let entry = &mut self.entries[index];
        entry.failure.take()?;
        Some(entry.clone())
    }

    pub fn reconcile(&mut self, incoming: Message) -> ReconcileOutcome {
        if self.scope.as_ref() != Some(&incoming.scope) {
            return ReconcileOutcome::OutOfScope;
        }
        let target = incoming.read_state.max(ReadState::Delivered);

        if let (Some(correlation_id), Some(server_id)) =
            (&incoming.correlation_id, incoming.server_id)
        {
            let optimistic = self.by_correlation.get(correlation_id).copied();
            let bound = self.by_server_id.get(&server_id).copied();
            if let (Some(optimistic), Some(bound)) = (optimistic, bound) {
                if optimistic != bound
                    && self.entries[bound].correlation_id.is_none()
                    && self.entries[optimistic].server_id.is_none()
                {
                    return self.adopt_correlation(bound, optimistic, correlation_id.clone(), target);
                }
            }
        }

        if let Some(correlation_id) = &incoming.correlation_id {
            if let Some(index) = self.by_correlation.get(correlation_id).copied() {
                let was_optimistic = self.entries[index].is_optimistic();
                let mut advanced = false;
                if let Some(server_id) = incoming.server_id {
                    advanced |= self.assign_server_id(index, server_id);
                }
                let entry = &mut self.entries[index];
                if was_optimistic {
                    entry.created_at = incoming.created_at;
                    entry.failure = None;
                }
                advanced |= entry.advance(target);
                return if was_optimistic {
                    debug!(%correlation_id, "reconcile: confirmed optimistic message");
                    ReconcileOutcome::Confirmed { index }
                } else {
                    ReconcileOutcome::Duplicate { index, advanced }
                };
            }
        }

        if let Some(server_id) = incoming.server_id {
            if let Some(index) = self.by_server_id.get(&server_id).copied() {
                if let Some(correlation_id) = incoming.correlation_id {
                    if self.entries[index].correlation_id.is_none()
                        && !self.by_correlation.contains_key(&correlation_id)
                    {
                        self.by_correlation.insert(correlation_id.clone(), index);
                        self.entries[index].correlation_id = Some(correlation_id);
                    }
                }
                let entry = &mut self.entries[index];
                entry.failure = None;
                let advanced = entry.advance(target);
                debug!(%server_id, "reconcile: skipping duplicate");
                return ReconcileOutcome::Duplicate { index, advanced };
            }
        }

        let mut message = incoming;
        message.read_state = target;
        message.failure = None;
        let index = self.push_indexed(message);
        ReconcileOutcome::Appended { index }
    }

    pub fn apply_read_receipt(&mut self, server_ids: &HashSet<ServerMessageId>) -> usize {
        let mut updated = 0;
        for server_id in server_ids {
            let Some(index) = self.by_server_id.get(server_id).copied() else {
                continue;
            };
            let entry = &mut self.entries[index];
            if entry.sender == self.self_key && entry.advance(ReadState::Read) {
                updated += 1;
            }
        }
        updated
    }

    fn find_existing(&self, message: &Message) -> Option<usize> {
        message
            .server_id
            .and_then(|server_id| self.by_server_id.get(&server_id).copied())
            .or_else(|| {
                message
                    .correlation_id
                    .as_ref()
                    .and_then(|correlation_id| self.by_correlation.get(correlation_id).copied())
            })
    }

    /// A copy known only by server id landed before the echo that links it
    /// to the optimistic entry: fold the optimistic entry into it.
    fn adopt_correlation(
        &mut self,
        bound: usize,
        optimistic: usize,
        correlation_id: CorrelationId,
        state: ReadState,
    ) -> ReconcileOutcome {
        self.entries.remove(optimistic);
        let index = if bound > optimistic { bound - 1 } else { bound };
        let entry = &mut self.entries[index];
        entry.correlation_id = Some(correlation_id.clone());
        entry.failure = None;
        entry.advance(state);
        self.reindex();
        debug!(%correlation_id, "reconcile: merged optimistic message into polled copy");
        ReconcileOutcome::Confirmed { index }
    }

    fn reindex(&mut self) {
        self.by_server_id.clear();
        self.by_correlation.clear();
        for (index, message) in self.entries.iter().enumerate() {
            if let Some(server_id) = message.server_id {
                self.by_server_id.insert(server_id, index);
            }
            if let Some(correlation_id) = &message.correlation_id {
                self.by_correlation.insert(correlation_id.clone(), index);
            }
        }
    }

    fn assign_server_id(&mut self, index: usize, server_id: ServerMessageId) -> bool {
        match self.by_server_id.get(&server_id) {
            Some(existing) if *existing == index => false,
            Some(existing) => {
                warn!(
                    %server_id,
                    existing = *existing,
                    index,
                    "reconcile: server id already bound to another entry"
                );
                false
            }
            None => {
                if self.entries[index].server_id.is_some() {
                    return false;
                }
                self.entries[index].server_id = Some(server_id);
                self.by_server_id.insert(server_id, index);
                true
            }
        }
    }

    fn push_indexed(&mut self, message: Message) -> usize {
        let index = self.entries.len();
        if let Some(server_id) = message.server_id {
            self.by_server_id.insert(server_id, index);
        }
        if let Some(correlation_id) = &message.correlation_id {
            self.by_correlation.insert(correlation_id.clone(), index);
        }
        self.entries.push(message);
        index
    }
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
