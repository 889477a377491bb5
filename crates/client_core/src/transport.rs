use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ConversationScope, TenantId},
    protocol::ClientFrame,
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::ChatSettings,
    connection::{ChannelConnector, ChannelHandle},
};

const CHANNEL_PATH: &str = "/ws/chat/";
const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// Opens one websocket per conversation at `/ws/chat/`.
pub struct WebSocketConnector {
    ws_base_url: String,
    session_cookie: Option<String>,
}

impl WebSocketConnector {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
            session_cookie: None,
        }
    }

    pub fn from_settings(settings: &ChatSettings) -> Result<Self> {
        let mut connector = Self::new(settings.ws_base_url()?);
        connector.session_cookie = settings.session_cookie.clone();
        Ok(connector)
    }

    pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.session_cookie = Some(cookie.into());
        self
    }

    pub fn channel_url(&self, tenant: &TenantId, scope: &ConversationScope) -> Result<Url> {
        if tenant.is_empty() {
            return Err(anyhow!("tenant is required to open a channel"));
        }
        if !scope.is_addressable() {
            return Err(anyhow!("{scope} has no address"));
        }
        let mut url = Url::parse(&format!("{}{CHANNEL_PATH}", self.ws_base_url))
            .with_context(|| format!("invalid channel base url: {}", self.ws_base_url))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("tenant", tenant.as_str());
            match scope {
                ConversationScope::Direct(peer) => query.append_pair("peer", peer.as_str()),
                ConversationScope::Group(group_id) => {
                    query.append_pair("group", group_id.as_str())
                }
            };
        }
        Ok(url)
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn open(&self, tenant: &TenantId, scope: &ConversationScope) -> Result<ChannelHandle> {
        let url = self.channel_url(tenant, scope)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(cookie) = &self.session_cookie {
            request
                .headers_mut()
                .insert("cookie", HeaderValue::from_str(cookie)?);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<ClientFrame>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel::<String>(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "websocket: failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(error = %err, "websocket: send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let channel = scope.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(scope = %channel, error = %err, "websocket: receive failed");
                        break;
                    }
                }
            }
            debug!(scope = %channel, "websocket: reader finished");
        });

        Ok(ChannelHandle { outbound, inbound })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
