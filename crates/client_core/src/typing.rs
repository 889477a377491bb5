//! Composition activity notices, both directions.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::domain::{PeerKey, TypingStatus};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;

#[async_trait]
pub trait TypingTransport: Send + Sync {
    async fn send_typing(&self, to: &PeerKey, status: TypingStatus);
}

#[derive(Default)]
struct Burst {
    to: Option<PeerKey>,
    generation: u64,
    idle_task: Option<JoinHandle<()>>,
}

/// Debounces local keystrokes into one `Typing` per burst and one `Idle`
/// after `idle_after` without input.
pub struct TypingNotifier {
    transport: Arc<dyn TypingTransport>,
    idle_after: Duration,
    burst: Arc<Mutex<Burst>>,
}

impl TypingNotifier {
    pub fn new(transport: Arc<dyn TypingTransport>, idle_after: Duration) -> Self {
        Self {
            transport,
            idle_after,
            burst: Arc::new(Mutex::new(Burst::default())),
        }
    }

    pub async fn notify_typing(&self, to: &PeerKey, active: bool) {
        if to.is_empty() {
            return;
        }
        let mut burst = self.burst.lock().await;
        if let Some(task) = burst.idle_task.take() {
            task.abort();
        }

        if !active {
            if let Some(previous) = burst.to.take() {
                self.transport
                    .send_typing(&previous, TypingStatus::Idle)
                    .await;
            }
            return;
        }

        if burst.to.as_ref() != Some(to) {
            if let Some(previous) = burst.to.replace(to.clone()) {
                self.transport
                    .send_typing(&previous, TypingStatus::Idle)
                    .await;
            }
            debug!(%to, "typing: burst started");
            self.transport.send_typing(to, TypingStatus::Typing).await;
        }

        burst.generation += 1;
        let generation = burst.generation;
        let state = Arc::clone(&self.burst);
        let transport = Arc::clone(&self.transport);
        let idle_after = self.idle_after;
        burst.idle_task = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_after).await;
            let mut burst = state.lock().await;
            if burst.generation != generation {
                return;
            }
            burst.idle_task = None;
            if let Some(previous) = burst.to.take() {
                transport.send_typing(&previous, TypingStatus::Idle).await;
            }
        }));
    }

    pub async fn reset(&self) {
        let mut burst = self.burst.lock().await;
        if let Some(task) = burst.idle_task.take() {
            task.abort();
        }
        if let Some(previous) = burst.to.take() {
            self.transport
                .send_typing(&previous, TypingStatus::Idle)
                .await;
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        if let Ok(mut burst) = self.burst.try_lock() {
            if let Some(task) = burst.idle_task.take() {
                task.abort();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingState {
    pub from: PeerKey,
    pub to: PeerKey,
    pub active: bool,
    pub expires_at: Instant,
}

/// Remote typing indicator that clears itself after `display_for` even when
/// no idle notice ever arrives.
pub struct RemoteTypingDisplay {
    display_for: Duration,
    state: Arc<watch::Sender<Option<TypingState>>>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteTypingDisplay {
    pub fn new(display_for: Duration) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            display_for,
            state: Arc::new(state),
            expiry: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TypingState>> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Option<TypingState> {
        self.state
            .borrow()
            .clone()
            .filter(|state| state.expires_at > Instant::now())
    }

    pub async fn apply(&self, from: PeerKey, to: PeerKey, active: bool) {
        let mut expiry = self.expiry.lock().await;
        if let Some(task) = expiry.take() {
            task.abort();
        }
        if !active {
            self.state.send_if_modified(|current| current.take().is_some());
            return;
        }

        let expires_at = Instant::now() + self.display_for;
        self.state.send_replace(Some(TypingState {
            from,
            to,
            active,
            expires_at,
        }));
        let state = Arc::clone(&self.state);
        *expiry = Some(tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            state.send_if_modified(|current| match current {
                Some(shown) if shown.expires_at == expires_at => {
                    *current = None;
                    true
                }
                _ => false,
            });
        }));
    }

    pub async fn clear(&self) {
        if let Some(task) = self.expiry.lock().await.take() {
            task.abort();
        }
        self.state.send_if_modified(|current| current.take().is_some());
    }
}

impl Drop for RemoteTypingDisplay {
    fn drop(&mut self) {
        if let Some(task) = self.expiry.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
