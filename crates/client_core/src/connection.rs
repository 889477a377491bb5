//! Realtime channel lifecycle for the open conversation.
//!
//! One session task owns the channel of the active scope. It reconnects with
//! capped exponential backoff and, while the channel is down, runs a polling
//! fallback that re-fetches history on a fixed interval. Both paths feed the
//! same sink, whose reconciliation makes double delivery harmless.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ConversationScope, TenantId},
    protocol::{ChannelEvent, ClientFrame},
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
}

/// Both halves of an open channel. The channel is closed when `inbound`
/// yields `None`; dropping `outbound` closes it from this side.
pub struct ChannelHandle {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, tenant: &TenantId, scope: &ConversationScope) -> Result<ChannelHandle>;
}

pub struct MissingChannelConnector;

#[async_trait]
impl ChannelConnector for MissingChannelConnector {
    async fn open(&self, _tenant: &TenantId, scope: &ConversationScope) -> Result<ChannelHandle> {
        Err(anyhow::anyhow!("realtime channel unavailable for {scope}"))
    }
}

#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    async fn on_event(&self, scope: &ConversationScope, event: ChannelEvent);
    async fn poll_history(&self, scope: &ConversationScope);
    /// The channel of `scope` went away after being open. Frames queued on
    /// it may never have reached the server.
    async fn on_channel_closed(&self, scope: &ConversationScope);
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub fallback_after: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

pub fn decode_event(raw: &str) -> Result<ChannelEvent, ChatError> {
    serde_json::from_str(raw).map_err(|err| ChatError::MalformedEvent(err.to_string()))
}

struct PollingFallback {
    task: JoinHandle<()>,
}

impl PollingFallback {
    fn start(
        sink: Arc<dyn ChannelEventSink>,
        scope: ConversationScope,
        delay: Duration,
        interval: Duration,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(%scope, interval_ms = interval.as_millis() as u64, "fallback: polling history");
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sink.poll_history(&scope).await;
            }
        });
        Self { task }
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SessionShared {
    scope: ConversationScope,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: Mutex<Option<mpsc::Sender<ClientFrame>>>,
}

impl SessionShared {
    fn publish(&self, state: ConnectionState) {
        if self.current_generation.load(Ordering::SeqCst) == self.generation {
            self.state.send_replace(state);
        }
    }
}

struct ActiveChannel {
    shared: Arc<SessionShared>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    connector: Arc<dyn ChannelConnector>,
    settings: ConnectionSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    active: Mutex<Option<ActiveChannel>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn ChannelConnector>, settings: ConnectionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            connector,
            settings,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn active_scope(&self) -> Option<ConversationScope> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.shared.scope.clone())
    }

    /// Binds the channel to `scope`, closing the channel of any other scope
    /// without reconnecting it. Selecting the bound scope again is a no-op.
    pub async fn select_scope(
        &self,
        tenant: TenantId,
        scope: ConversationScope,
        sink: Arc<dyn ChannelEventSink>,
    ) {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.as_ref() {
            if active.shared.scope == scope && !active.task.is_finished() {
                return;
            }
        }
        if let Some(previous) = guard.take() {
            info!(scope = %previous.shared.scope, "channel: closing for scope switch");
            previous.task.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Closed);
        let shared = Arc::new(SessionShared {
            scope,
            generation,
            current_generation: Arc::clone(&self.generation),
            state: Arc::clone(&self.state),
            outbound: Mutex::new(None),
        });
        let task = tokio::spawn(run_session(
            Arc::clone(&shared),
            Arc::clone(&self.connector),
            sink,
            self.settings.clone(),
            tenant,
        ));
        *guard = Some(ActiveChannel { shared, task });
    }

    pub async fn close(&self) {
        let mut guard = self.active.lock().await;
        if let Some(previous) = guard.take() {
            info!(scope = %previous.shared.scope, "channel: closing");
            previous.task.abort();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Closed);
    }

    pub async fn send_frame(
        &self,
        scope: &ConversationScope,
        frame: ClientFrame,
    ) -> Result<(), ChatError> {
        let sender = self.outbound_for(scope).await?;
        sender
            .send(frame)
            .await
            .map_err(|_| ChatError::Transport(format!("channel for {scope} closed during send")))
    }

    async fn outbound_for(
        &self,
        scope: &ConversationScope,
    ) -> Result<mpsc::Sender<ClientFrame>, ChatError> {
        let guard = self.active.lock().await;
        let Some(active) = guard.as_ref().filter(|active| &active.shared.scope == scope) else {
            return Err(ChatError::Transport(format!("no channel bound to {scope}")));
        };
        let outbound = active.shared.outbound.lock().await.clone();
        outbound.ok_or_else(|| ChatError::Transport(format!("channel for {scope} is not open")))
    }
}

async fn run_session(
    shared: Arc<SessionShared>,
    connector: Arc<dyn ChannelConnector>,
    sink: Arc<dyn ChannelEventSink>,
    settings: ConnectionSettings,
    tenant: TenantId,
) {
    let scope = shared.scope.clone();
    let mut backoff = Backoff::new(settings.reconnect_initial, settings.reconnect_max);
    let mut fallback: Option<PollingFallback> = None;
    let mut attempt: u32 = 0;

    loop {
        shared.publish(ConnectionState::Connecting);
        match connector.open(&tenant, &scope).await {
            Ok(handle) => {
                let ChannelHandle {
                    outbound,
                    mut inbound,
                } = handle;
                backoff.reset();
                attempt = 0;
                *shared.outbound.lock().await = Some(outbound);
                shared.publish(ConnectionState::Open);
                info!(%scope, "channel: open");

                if fallback.take().is_some() {
                    info!(%scope, "fallback: stopped, running catch-up poll");
                    sink.poll_history(&scope).await;
                }

                while let Some(raw) = inbound.recv().await {
                    match decode_event(&raw) {
                        Ok(event) => sink.on_event(&scope, event).await,
                        Err(err) => warn!(%scope, error = %err, "channel: dropping event"),
                    }
                }

                *shared.outbound.lock().await = None;
                info!(%scope, "channel: closed by transport");
                sink.on_channel_closed(&scope).await;
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(%scope, attempt, %error, "channel: open failed");
            }
        }

        attempt = attempt.saturating_add(1);
        shared.publish(ConnectionState::Reconnecting { attempt });
        if fallback.is_none() {
            fallback = Some(PollingFallback::start(
                Arc::clone(&sink),
                scope.clone(),
                settings.fallback_after,
                settings.poll_interval,
            ));
        }
        let delay = backoff.next_delay();
        debug!(%scope, attempt, delay_ms = delay.as_millis() as u64, "channel: reconnecting");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
