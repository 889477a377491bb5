//! Request/response calls to the chat backend.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationScope, TenantId},
    error::ApiError,
    protocol::{
        HistoryEntry, HistoryResponse, MarkReadRequest, MarkReadResponse, MemberSummary,
        MembersResponse, SubmitMessageRequest, SubmitMessageResponse, UnreadCount,
        UnreadCountsResponse,
    },
};
use tracing::debug;

use crate::config::ChatSettings;

pub const CSRF_HEADER: &str = "X-CSRFToken";

#[async_trait]
pub trait ChatCollaborator: Send + Sync {
    async fn list_members(&self, tenant: &TenantId) -> Result<Vec<MemberSummary>>;
    async fn fetch_history(&self, scope: &ConversationScope) -> Result<Vec<HistoryEntry>>;
    /// Idempotent on the request's correlation id.
    async fn submit_message(&self, request: SubmitMessageRequest) -> Result<SubmitMessageResponse>;
    async fn mark_read(&self, scope: &ConversationScope) -> Result<()>;
    async fn fetch_unread_counts(&self) -> Result<Vec<UnreadCount>>;
}

pub struct MissingChatCollaborator;

#[async_trait]
impl ChatCollaborator for MissingChatCollaborator {
    async fn list_members(&self, _tenant: &TenantId) -> Result<Vec<MemberSummary>> {
        Err(anyhow!("chat collaborator unavailable"))
    }

    async fn fetch_history(&self, _scope: &ConversationScope) -> Result<Vec<HistoryEntry>> {
        Err(anyhow!("chat collaborator unavailable"))
    }

    async fn submit_message(
        &self,
        _request: SubmitMessageRequest,
    ) -> Result<SubmitMessageResponse> {
        Err(anyhow!("chat collaborator unavailable"))
    }

    async fn mark_read(&self, _scope: &ConversationScope) -> Result<()> {
        Err(anyhow!("chat collaborator unavailable"))
    }

    async fn fetch_unread_counts(&self) -> Result<Vec<UnreadCount>> {
        Err(anyhow!("chat collaborator unavailable"))
    }
}

pub struct HttpCollaborator {
    http: Client,
    server_url: String,
    csrf_token: Option<String>,
    session_cookie: Option<String>,
}

impl HttpCollaborator {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            csrf_token: None,
            session_cookie: None,
        }
    }

    pub fn from_settings(settings: &ChatSettings) -> Result<Self> {
        let mut collaborator = Self::new(settings.http_base_url()?);
        collaborator.csrf_token = settings.csrf_token.clone();
        collaborator.session_cookie = settings.session_cookie.clone();
        Ok(collaborator)
    }

    pub fn with_csrf_token(mut self, token: impl Into<String>) -> Self {
        self.csrf_token = Some(token.into());
        self
    }

    pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.session_cookie = Some(cookie.into());
        self
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.with_session(self.http.get(format!("{}{path}", self.server_url)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.with_session(self.http.post(format!("{}{path}", self.server_url)));
        match &self.csrf_token {
            Some(token) => request.header(CSRF_HEADER, token),
            None => request,
        }
    }

    fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session_cookie {
            Some(cookie) => request.header(header::COOKIE, cookie),
            None => request,
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_response(status.as_u16(), &body).into())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    Ok(ensure_success(response).await?.json().await?)
}

#[async_trait]
impl ChatCollaborator for HttpCollaborator {
    async fn list_members(&self, tenant: &TenantId) -> Result<Vec<MemberSummary>> {
        let response: MembersResponse = decode(
            self.get("/chat/members/")
                .query(&[("tenant", tenant.as_str())])
                .send()
                .await?,
        )
        .await?;
        Ok(response.members)
    }

    async fn fetch_history(&self, scope: &ConversationScope) -> Result<Vec<HistoryEntry>> {
        let request = match scope {
            ConversationScope::Direct(peer) => self
                .get("/chat/history/")
                .query(&[("peer", peer.as_str())]),
            ConversationScope::Group(group_id) => self
                .get("/chat/group/history/")
                .query(&[("group_id", group_id.as_str())]),
        };
        let response: HistoryResponse = decode(request.send().await?).await?;
        debug!(%scope, count = response.messages.len(), "history: fetched");
        Ok(response.messages)
    }

    async fn submit_message(&self, request: SubmitMessageRequest) -> Result<SubmitMessageResponse> {
        decode(self.post("/chat/send/").json(&request).send().await?).await
    }

    async fn mark_read(&self, scope: &ConversationScope) -> Result<()> {
        let response: MarkReadResponse = decode(
            self.post("/chat/mark_read/")
                .json(&MarkReadRequest {
                    scope: scope.clone(),
                })
                .send()
                .await?,
        )
        .await?;
        if !response.ok {
            return Err(anyhow!("mark read rejected for {scope}"));
        }
        Ok(())
    }

    async fn fetch_unread_counts(&self) -> Result<Vec<UnreadCount>> {
        let response: UnreadCountsResponse =
            decode(self.get("/chat/unread/").send().await?).await?;
        Ok(response.unread)
    }
}

#[cfg(test)]
#[path = "tests/collaborator_tests.rs"]
mod tests;
