use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{
        ConversationScope, CorrelationId, GroupId, PeerKey, PresenceStatus, ReadState,
        ServerMessageId, TenantId, TypingStatus,
    },
    protocol::{
        ChannelEvent, ClientFrame, HistoryEntry, MemberSummary, SubmitMessageRequest, UnreadCount,
        WireMessage,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

pub mod collaborator;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod message_log;
pub mod presence;
pub mod transport;
pub mod typing;
pub mod unread;

use collaborator::{ChatCollaborator, HttpCollaborator};
use config::ChatSettings;
use connection::{ChannelConnector, ChannelEventSink, ConnectionManager, ConnectionState};
use error::ChatError;
use identity::MemberDirectory;
use message_log::{Message, MessageLog, ReconcileOutcome};
use presence::PresenceTracker;
use transport::WebSocketConnector;
use typing::{RemoteTypingDisplay, TypingNotifier, TypingState, TypingTransport};
use unread::UnreadLedger;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MembersLoaded {
        self_key: PeerKey,
        count: usize,
    },
    ConversationOpened(ConversationScope),
    LogChanged(ConversationScope),
    MessageFailed {
        correlation_id: CorrelationId,
        reason: String,
    },
    PresenceChanged {
        peer: PeerKey,
        status: PresenceStatus,
    },
    UnreadChanged {
        scope: ConversationScope,
        count: u32,
    },
    UnreadReconciled(Vec<UnreadCount>),
    TypingChanged(Option<TypingState>),
    ConnectionStateChanged(ConnectionState),
    Error(String),
}

struct SessionState {
    tenant: TenantId,
    configured_identity: Option<String>,
    directory: MemberDirectory,
    active_scope: Option<ConversationScope>,
    log: MessageLog,
    history_task: Option<JoinHandle<()>>,
    /// Sent as channel frames, not yet echoed back. Survives scope switches.
    unconfirmed: HashMap<CorrelationId, Message>,
}

impl SessionState {
    fn confirm(&mut self, correlation_id: Option<&CorrelationId>) {
        if let Some(correlation_id) = correlation_id {
            if self.unconfirmed.remove(correlation_id).is_some() {
                debug!(%correlation_id, "send: channel frame confirmed");
            }
        }
    }
}

struct ChannelTypingTransport {
    connection: Arc<ConnectionManager>,
    self_key: Arc<RwLock<PeerKey>>,
}

#[async_trait]
impl TypingTransport for ChannelTypingTransport {
    async fn send_typing(&self, to: &PeerKey, status: TypingStatus) {
        let from = self.self_key.read().await.clone();
        if from.is_empty() {
            debug!(%to, "typing: own identity unknown, notice dropped");
            return;
        }
        let scope = ConversationScope::Direct(to.clone());
        let frame = ClientFrame::Typing {
            from: from.to_string(),
            to: to.to_string(),
            status,
        };
        if let Err(err) = self.connection.send_frame(&scope, frame).await {
            debug!(%to, error = %err, "typing: notice dropped");
        }
    }
}

/// Session controller: owns the open conversation and routes everything the
/// channel, the polling fallback and the caller produce into the engine.
pub struct ChatClient {
    handle: Weak<ChatClient>,
    collaborator: Arc<dyn ChatCollaborator>,
    connection: Arc<ConnectionManager>,
    presence: PresenceTracker,
    unread: UnreadLedger,
    typing: TypingNotifier,
    remote_typing: RemoteTypingDisplay,
    unread_refresh: Duration,
    echo_timeout: Duration,
    self_key: Arc<RwLock<PeerKey>>,
    inner: Mutex<SessionState>,
    background: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(settings: &ChatSettings) -> Result<Arc<Self>> {
        let collaborator = Arc::new(HttpCollaborator::from_settings(settings)?);
        let connector = Arc::new(WebSocketConnector::from_settings(settings)?);
        Ok(Self::new_with_dependencies(settings, collaborator, connector))
    }

    pub fn new_with_dependencies(
        settings: &ChatSettings,
        collaborator: Arc<dyn ChatCollaborator>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let connection = Arc::new(ConnectionManager::new(
            connector,
            settings.connection_settings(),
        ));
        let self_key = Arc::new(RwLock::new(identity::normalize(
            settings.identity.as_deref(),
        )));
        let typing = TypingNotifier::new(
            Arc::new(ChannelTypingTransport {
                connection: Arc::clone(&connection),
                self_key: Arc::clone(&self_key),
            }),
            settings.typing_idle(),
        );

        Arc::new_cyclic(|handle| Self {
            handle: handle.clone(),
            collaborator,
            connection,
            presence: PresenceTracker::new(),
            unread: UnreadLedger::new(),
            typing,
            remote_typing: RemoteTypingDisplay::new(settings.typing_display()),
            unread_refresh: settings.unread_refresh(),
            echo_timeout: settings.echo_timeout(),
            self_key: Arc::clone(&self_key),
            inner: Mutex::new(SessionState {
                tenant: TenantId::new(&settings.tenant),
                configured_identity: settings.identity.clone(),
                directory: MemberDirectory::default(),
                active_scope: None,
                log: MessageLog::new(identity::normalize(settings.identity.as_deref())),
                history_task: None,
                unconfirmed: HashMap::new(),
            }),
            background: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe_typing(&self) -> watch::Receiver<Option<TypingState>> {
        self.remote_typing.subscribe()
    }

    pub async fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            return;
        }

        let client = Arc::clone(self);
        let period = self.unread_refresh.max(Duration::from_millis(1));
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = client.refresh_counts().await {
                    warn!(error = %err, "unread: refresh failed");
                }
            }
        }));

        let mut connection_state = self.connection.subscribe_state();
        let events = self.events.clone();
        background.push(tokio::spawn(async move {
            while connection_state.changed().await.is_ok() {
                let state = *connection_state.borrow_and_update();
                let _ = events.send(ClientEvent::ConnectionStateChanged(state));
            }
        }));

        let mut typing_state = self.remote_typing.subscribe();
        let events = self.events.clone();
        background.push(tokio::spawn(async move {
            while typing_state.changed().await.is_ok() {
                let state = typing_state.borrow_and_update().clone();
                let _ = events.send(ClientEvent::TypingChanged(state));
            }
        }));
    }

    /// Stops every background task and closes the channel. Session tasks
    /// hold the client, so this is also what lets it be dropped.
    pub async fn shutdown(&self) {
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        if let Some(task) = self.inner.lock().await.history_task.take() {
            task.abort();
        }
        self.typing.reset().await;
        self.remote_typing.clear().await;
        self.connection.close().await;
        info!("client: shut down");
    }

    pub async fn self_key(&self) -> PeerKey {
        self.self_key.read().await.clone()
    }

    pub async fn load_members(&self) -> Result<Vec<MemberSummary>, ChatError> {
        let tenant = self.inner.lock().await.tenant.clone();
        if tenant.is_empty() {
            return Err(ChatError::Addressing("tenant is required".into()));
        }
        let members = self
            .collaborator
            .list_members(&tenant)
            .await
            .map_err(ChatError::collaborator)?;

        let directory = MemberDirectory::new(members.clone());
        let self_key = {
            let mut inner = self.inner.lock().await;
            let self_key =
                directory.resolve(None, None, true, inner.configured_identity.as_deref());
            inner.log.set_self_key(self_key.clone());
            inner.directory = directory;
            self_key
        };
        *self.self_key.write().await = self_key.clone();
        info!(%tenant, count = members.len(), %self_key, "members: loaded");
        self.emit(ClientEvent::MembersLoaded {
            self_key,
            count: members.len(),
        });
        Ok(members)
    }

    pub async fn members(&self) -> Vec<MemberSummary> {
        self.inner.lock().await.directory.members().to_vec()
    }

    pub async fn display_name(&self, peer: &PeerKey) -> Option<String> {
        self.inner
            .lock()
            .await
            .directory
            .display_name(peer)
            .map(str::to_string)
    }

    pub async fn select_peer(self: &Arc<Self>, raw: &str) -> Result<(), ChatError> {
        let peer = self.inner.lock().await.directory.canonical(raw);
        if peer.is_empty() {
            return Err(ChatError::Addressing(format!("cannot resolve peer {raw:?}")));
        }
        self.select_scope(ConversationScope::Direct(peer)).await
    }

    pub async fn select_member(self: &Arc<Self>, member: &MemberSummary) -> Result<(), ChatError> {
        let peer = {
            let inner = self.inner.lock().await;
            inner.directory.resolve(
                Some(member.address.as_str()),
                Some(member.display_name.as_str()),
                member.is_self,
                inner.configured_identity.as_deref(),
            )
        };
        if peer.is_empty() {
            return Err(ChatError::Addressing(format!(
                "member {} has no address",
                member.id
            )));
        }
        self.select_scope(ConversationScope::Direct(peer)).await
    }

    pub async fn select_group(self: &Arc<Self>, group_id: &str) -> Result<(), ChatError> {
        self.select_scope(ConversationScope::Group(GroupId::new(group_id)))
            .await
    }

    /// Makes `scope` the open conversation: resets the log, rebinds the
    /// channel, loads history and marks the conversation read.
    pub async fn select_scope(self: &Arc<Self>, scope: ConversationScope) -> Result<(), ChatError> {
        if !scope.is_addressable() {
            return Err(ChatError::Addressing(format!("{scope} has no address")));
        }
        let tenant = {
            let mut inner = self.inner.lock().await;
            if inner.tenant.is_empty() {
                return Err(ChatError::Addressing("tenant is required".into()));
            }
            if let Some(task) = inner.history_task.take() {
                task.abort();
            }
            inner.active_scope = Some(scope.clone());
            inner.log.reset(Some(scope.clone()));
            inner.tenant.clone()
        };
        info!(%scope, "conversation: opened");

        self.typing.reset().await;
        self.remote_typing.clear().await;
        let sink: Arc<dyn ChannelEventSink> = Arc::clone(self) as Arc<dyn ChannelEventSink>;
        self.connection
            .select_scope(tenant, scope.clone(), sink)
            .await;

        // Frames queued on a channel that was just closed may be lost.
        let client = Arc::clone(self);
        let opened = scope.clone();
        tokio::spawn(async move {
            client
                .flush_unconfirmed("conversation switched", |message| message.scope != opened)
                .await;
        });

        let client = Arc::clone(self);
        let history_scope = scope.clone();
        let task = tokio::spawn(async move {
            client.load_history_for(&history_scope).await;
        });
        {
            let mut inner = self.inner.lock().await;
            if inner.active_scope.as_ref() == Some(&scope) {
                inner.history_task = Some(task);
            } else {
                task.abort();
            }
        }
        self.emit(ClientEvent::ConversationOpened(scope.clone()));

        if let Err(err) = self.mark_read_scope(&scope).await {
            warn!(%scope, error = %err, "unread: mark read on open failed");
            self.emit(ClientEvent::Error(err.to_string()));
        }
        Ok(())
    }

    pub async fn active_scope(&self) -> Option<ConversationScope> {
        self.inner.lock().await.active_scope.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.log.messages().to_vec()
    }

    pub async fn send(self: &Arc<Self>, text: &str) -> Result<Message, ChatError> {
        let message = {
            let mut inner = self.inner.lock().await;
            inner.log.push_pending(text)?
        };
        self.emit(ClientEvent::LogChanged(message.scope.clone()));
        self.typing.reset().await;

        let client = Arc::clone(self);
        let submission = message.clone();
        tokio::spawn(async move {
            client.submit(submission).await;
        });
        Ok(message)
    }

    pub async fn resend(self: &Arc<Self>, correlation_id: &CorrelationId) -> Result<(), ChatError> {
        let message = self
            .inner
            .lock()
            .await
            .log
            .take_failed(correlation_id)
            .ok_or_else(|| ChatError::UnknownMessage(correlation_id.clone()))?;
        info!(%correlation_id, "send: manual resend");
        self.emit(ClientEvent::LogChanged(message.scope.clone()));

        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.submit(message).await;
        });
        Ok(())
    }

    async fn submit(&self, message: Message) {
        let Some(correlation_id) = message.correlation_id.clone() else {
            return;
        };
        let scope = message.scope.clone();

        if self.connection.state() == ConnectionState::Open {
            // Registered first so an echo racing the send still confirms it.
            self.inner
                .lock()
                .await
                .unconfirmed
                .insert(correlation_id.clone(), message.clone());
            let frame = ClientFrame::for_scope(&scope, &message.text, correlation_id.clone());
            match self.connection.send_frame(&scope, frame).await {
                Ok(()) => {
                    self.spawn_echo_watch(correlation_id);
                    return;
                }
                Err(err) => {
                    debug!(%correlation_id, error = %err, "send: channel unavailable, using collaborator");
                    let queued = self.inner.lock().await.unconfirmed.remove(&correlation_id);
                    if queued.is_none() {
                        return;
                    }
                }
            }
        }
        self.submit_durable(message).await;
    }

    async fn submit_durable(&self, message: Message) {
        let Some(correlation_id) = message.correlation_id.clone() else {
            return;
        };
        let scope = message.scope.clone();
        let result = self
            .collaborator
            .submit_message(SubmitMessageRequest {
                scope: scope.clone(),
                text: message.text.clone(),
                correlation_id: correlation_id.clone(),
            })
            .await;

        match result {
            Ok(response) => {
                let acknowledged = self
                    .inner
                    .lock()
                    .await
                    .log
                    .acknowledge(&correlation_id, Some(response.server_id));
                if acknowledged {
                    self.emit(ClientEvent::LogChanged(scope));
                }
            }
            Err(err) => {
                let reason = match ChatError::submission(correlation_id.clone(), &err) {
                    ChatError::Submission { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(%correlation_id, %scope, %reason, "send: submission failed");
                let marked = self
                    .inner
                    .lock()
                    .await
                    .log
                    .mark_failed(&correlation_id, reason.clone());
                if marked {
                    self.emit(ClientEvent::LogChanged(scope));
                }
                self.emit(ClientEvent::MessageFailed {
                    correlation_id,
                    reason,
                });
            }
        }
    }

    fn spawn_echo_watch(&self, correlation_id: CorrelationId) {
        let Some(client) = self.handle.upgrade() else {
            return;
        };
        let timeout = self.echo_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            client
                .flush_unconfirmed("no echo", |message| {
                    message.correlation_id.as_ref() == Some(&correlation_id)
                })
                .await;
        });
    }

    async fn flush_unconfirmed(&self, cause: &str, selected: impl Fn(&Message) -> bool) {
        let flushed: Vec<Message> = {
            let mut inner = self.inner.lock().await;
            let (flushed, kept): (HashMap<_, _>, HashMap<_, _>) =
                std::mem::take(&mut inner.unconfirmed)
                    .into_iter()
                    .partition(|(_, message)| selected(message));
            inner.unconfirmed = kept;
            flushed.into_values().collect()
        };
        for message in flushed {
            if let Some(correlation_id) = &message.correlation_id {
                info!(%correlation_id, cause, "send: resubmitting through collaborator");
            }
            self.submit_durable(message).await;
        }
    }

    pub async fn mark_read(&self) -> Result<(), ChatError> {
        let scope = self
            .active_scope()
            .await
            .ok_or(ChatError::NotReady("no conversation is open"))?;
        self.mark_read_scope(&scope).await
    }

    async fn mark_read_scope(&self, scope: &ConversationScope) -> Result<(), ChatError> {
        if !scope.is_addressable() {
            return Err(ChatError::Addressing(format!("{scope} has no address")));
        }
        let cleared = self.unread.clear(scope).await;
        if cleared > 0 {
            self.emit(ClientEvent::UnreadChanged {
                scope: scope.clone(),
                count: 0,
            });
        }
        self.collaborator
            .mark_read(scope)
            .await
            .map_err(ChatError::collaborator)?;
        debug!(%scope, cleared, "unread: marked read");
        Ok(())
    }

    fn spawn_mark_read(&self, scope: ConversationScope) {
        let Some(client) = self.handle.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = client.mark_read_scope(&scope).await {
                warn!(%scope, error = %err, "unread: auto mark read failed");
            }
        });
    }

    pub async fn refresh_counts(&self) -> Result<(), ChatError> {
        let counts = self
            .collaborator
            .fetch_unread_counts()
            .await
            .map_err(ChatError::collaborator)?;
        if self.unread.reconcile(counts).await {
            self.emit(ClientEvent::UnreadReconciled(self.unread.snapshot().await));
        }
        Ok(())
    }

    pub async fn unread_count(&self, scope: &ConversationScope) -> u32 {
        self.unread.count(scope).await
    }

    pub async fn unread_counts(&self) -> Vec<UnreadCount> {
        self.unread.snapshot().await
    }

    pub async fn total_unread(&self) -> u32 {
        self.unread.total().await
    }

    pub async fn presence(&self, peer: &PeerKey) -> Option<PresenceStatus> {
        self.presence.status(peer).await
    }

    pub async fn online_peers(&self) -> Vec<PeerKey> {
        self.presence.online_peers().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn typing_state(&self) -> Option<TypingState> {
        self.remote_typing.current()
    }

    pub async fn notify_typing(&self, active: bool) {
        let peer = match self.active_scope().await {
            Some(ConversationScope::Direct(peer)) => peer,
            _ => return,
        };
        self.typing.notify_typing(&peer, active).await;
    }

    async fn load_history_for(&self, scope: &ConversationScope) {
        let entries = match self.collaborator.fetch_history(scope).await {
            Ok(entries) => entries,
            Err(err) => {
                let err = ChatError::collaborator(err);
                warn!(%scope, error = %err, "history: load failed");
                self.emit(ClientEvent::Error(err.to_string()));
                return;
            }
        };
        let loaded = {
            let mut inner = self.inner.lock().await;
            let messages: Vec<Message> = entries
                .into_iter()
                .map(|entry| history_message(&inner.directory, scope, entry))
                .collect();
            for message in &messages {
                inner.confirm(message.correlation_id.as_ref());
            }
            inner.log.load_history(scope, messages)
        };
        if loaded {
            info!(%scope, "history: loaded");
            self.emit(ClientEvent::LogChanged(scope.clone()));
        }
    }

    async fn on_wire_message(&self, channel_scope: &ConversationScope, wire: WireMessage) {
        let self_key = self.self_key().await;
        let mut inner = self.inner.lock().await;
        let sender = inner.directory.canonical(&wire.sender);
        let scope = match wire.group_id {
            Some(group_id) if !group_id.is_empty() => ConversationScope::Group(group_id),
            _ => {
                let to = wire
                    .to
                    .as_deref()
                    .map(|raw| inner.directory.canonical(raw))
                    .unwrap_or_default();
                if !addressed_to_self(&sender, &to, &self_key) {
                    debug!(%sender, %to, "message: addressed to someone else, dropped");
                    return;
                }
                direct_scope(&sender, &to, &self_key, channel_scope)
            }
        };
        inner.confirm(wire.correlation_id.as_ref());
        let from_peer = sender != self_key;
        let active = inner.active_scope.clone();

        if active.as_ref() == Some(&scope) {
            let outcome = inner.log.reconcile(Message {
                server_id: wire.server_id,
                correlation_id: wire.correlation_id,
                sender,
                scope: scope.clone(),
                text: wire.text,
                created_at: wire.created_at,
                read_state: ReadState::Delivered,
                failure: None,
            });
            drop(inner);
            if outcome.changed_log() {
                self.emit(ClientEvent::LogChanged(scope.clone()));
            }
            if from_peer && matches!(outcome, ReconcileOutcome::Appended { .. }) {
                self.spawn_mark_read(scope);
            }
            return;
        }

        drop(inner);
        if let Some(count) = self
            .unread
            .on_inbound_message(&scope, &sender, &self_key, active.as_ref())
            .await
        {
            self.emit(ClientEvent::UnreadChanged { scope, count });
        }
    }

    async fn on_digest(&self, from: String, to: Option<String>, group_id: Option<GroupId>) {
        let self_key = self.self_key().await;
        let (sender, to, active) = {
            let inner = self.inner.lock().await;
            (
                inner.directory.canonical(&from),
                to.as_deref()
                    .map(|raw| inner.directory.canonical(raw))
                    .unwrap_or_default(),
                inner.active_scope.clone(),
            )
        };
        let scope = match group_id {
            Some(group_id) if !group_id.is_empty() => ConversationScope::Group(group_id),
            _ => {
                if !addressed_to_self(&sender, &to, &self_key) {
                    return;
                }
                ConversationScope::Direct(sender.clone())
            }
        };
        if let Some(count) = self
            .unread
            .on_inbound_message(&scope, &sender, &self_key, active.as_ref())
            .await
        {
            self.emit(ClientEvent::UnreadChanged { scope, count });
        }
    }

    async fn on_presence(&self, peer: String, status: PresenceStatus) {
        let peer = self.inner.lock().await.directory.canonical(&peer);
        if self.presence.set_status(peer.clone(), status).await {
            debug!(%peer, ?status, "presence: changed");
            self.emit(ClientEvent::PresenceChanged { peer, status });
        }
    }

    async fn on_typing(&self, from: String, to: String, status: TypingStatus) {
        let self_key = self.self_key().await;
        let (from, to, active_peer) = {
            let inner = self.inner.lock().await;
            (
                inner.directory.canonical(&from),
                inner.directory.canonical(&to),
                inner
                    .active_scope
                    .as_ref()
                    .and_then(ConversationScope::direct_peer)
                    .cloned(),
            )
        };
        if self_key.is_empty() || to != self_key || active_peer.as_ref() != Some(&from) {
            debug!(%from, %to, "typing: ignoring notice for another conversation");
            return;
        }
        self.remote_typing
            .apply(from, to, status.is_active())
            .await;
    }

    async fn on_read_receipt(&self, server_ids: Vec<ServerMessageId>) {
        let server_ids: HashSet<ServerMessageId> = server_ids.into_iter().collect();
        let (updated, scope) = {
            let mut inner = self.inner.lock().await;
            (
                inner.log.apply_read_receipt(&server_ids),
                inner.active_scope.clone(),
            )
        };
        if updated > 0 {
            debug!(updated, "read: receipts applied");
            if let Some(scope) = scope {
                self.emit(ClientEvent::LogChanged(scope));
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ChannelEventSink for ChatClient {
    async fn on_event(&self, scope: &ConversationScope, event: ChannelEvent) {
        match event {
            ChannelEvent::Message { message } => self.on_wire_message(scope, message).await,
            ChannelEvent::Presence { peer, status } => self.on_presence(peer, status).await,
            ChannelEvent::Typing { from, to, status } => self.on_typing(from, to, status).await,
            ChannelEvent::MessageRead { server_ids } => self.on_read_receipt(server_ids).await,
            ChannelEvent::NewMessage { from, to, group_id } => {
                self.on_digest(from, to, group_id).await
            }
        }
    }

    async fn poll_history(&self, scope: &ConversationScope) {
        let entries = match self.collaborator.fetch_history(scope).await {
            Ok(entries) => entries,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(%scope, %error, "fallback: poll failed");
                return;
            }
        };
        let self_key = self.self_key().await;
        let mut changed = false;
        let mut fresh_from_peer = false;
        {
            let mut inner = self.inner.lock().await;
            if inner.active_scope.as_ref() != Some(scope) {
                return;
            }
            for entry in entries {
                let message = history_message(&inner.directory, scope, entry);
                inner.confirm(message.correlation_id.as_ref());
                let from_peer = message.sender != self_key;
                let outcome = inner.log.reconcile(message);
                changed |= outcome.changed_log();
                fresh_from_peer |= from_peer && matches!(outcome, ReconcileOutcome::Appended { .. });
            }
        }
        if changed {
            debug!(%scope, "fallback: poll updated log");
            self.emit(ClientEvent::LogChanged(scope.clone()));
        }
        if fresh_from_peer {
            self.spawn_mark_read(scope.clone());
        }
    }

    async fn on_channel_closed(&self, scope: &ConversationScope) {
        self.flush_unconfirmed("channel closed", |message| &message.scope == scope)
            .await;
    }
}

/// A direct message from a peer must name self as recipient when it names
/// anyone. Own messages may go to any peer.
fn addressed_to_self(sender: &PeerKey, to: &PeerKey, self_key: &PeerKey) -> bool {
    if to.is_empty() || self_key.is_empty() || sender == self_key {
        return true;
    }
    to == self_key
}

fn direct_scope(
    sender: &PeerKey,
    to: &PeerKey,
    self_key: &PeerKey,
    channel_scope: &ConversationScope,
) -> ConversationScope {
    if !sender.is_empty() && sender != self_key {
        ConversationScope::Direct(sender.clone())
    } else if !to.is_empty() {
        ConversationScope::Direct(to.clone())
    } else {
        channel_scope.clone()
    }
}

fn history_message(
    directory: &MemberDirectory,
    scope: &ConversationScope,
    entry: HistoryEntry,
) -> Message {
    Message {
        server_id: Some(entry.server_id),
        correlation_id: entry.correlation_id,
        sender: directory.canonical(&entry.sender),
        scope: scope.clone(),
        text: entry.text,
        created_at: entry.created_at,
        read_state: if entry.is_read {
            ReadState::Read
        } else {
            ReadState::Delivered
        },
        failure: None,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
