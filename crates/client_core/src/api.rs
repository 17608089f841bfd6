use anyhow::{Context, Result};
use reqwest::Client;
use shared::{
    domain::{GroupId, UserId},
    protocol::{
        GroupSummary, MessageBody, MessageRecord, PeerSummary, SendDirectMessageRequest,
        UnreadCounts,
    },
};

/// Typed wrapper over the remote REST API. One instance per session; the
/// session token rides every request.
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Resolves an identity-provider id to a peer record; `None` on 404.
    pub async fn lookup_identity(&self, external_id: &str) -> Result<Option<PeerSummary>> {
        let response = self
            .http
            .get(format!("{}/users/lookup", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("external_id", external_id)])
            .send()
            .await
            .context("identity lookup request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(response.error_for_status()?.json().await?))
    }

    pub async fn peers_with_history(&self, user_id: UserId) -> Result<Vec<PeerSummary>> {
        let peers = self
            .http
            .get(format!("{}/users/{}/peers", self.base_url, user_id.0))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(peers)
    }

    pub async fn peer_roster(&self) -> Result<Vec<PeerSummary>> {
        let roster = self
            .http
            .get(format!("{}/users/roster", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(roster)
    }

    pub async fn groups_with_history(&self, user_id: UserId) -> Result<Vec<GroupSummary>> {
        let groups = self
            .http
            .get(format!("{}/users/{}/groups", self.base_url, user_id.0))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(groups)
    }

    pub async fn unread_counts(&self, user_id: UserId) -> Result<UnreadCounts> {
        let counts = self
            .http
            .get(format!("{}/users/{}/unread", self.base_url, user_id.0))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(counts)
    }

    pub async fn direct_messages(
        &self,
        user_id: UserId,
        peer_id: UserId,
    ) -> Result<Vec<MessageRecord>> {
        let messages = self
            .http
            .get(format!("{}/messages/direct", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("user_id", user_id.0), ("peer_id", peer_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    pub async fn group_messages(&self, group_id: GroupId) -> Result<Vec<MessageRecord>> {
        let messages = self
            .http
            .get(format!("{}/groups/{}/messages", self.base_url, group_id.0))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    pub async fn mark_direct_read(&self, user_id: UserId, peer_id: UserId) -> Result<()> {
        self.http
            .put(format!("{}/read/direct", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("user_id", user_id.0), ("peer_id", peer_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn mark_group_read(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        self.http
            .put(format!("{}/read/group", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("user_id", user_id.0), ("group_id", group_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn send_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        body: &MessageBody,
    ) -> Result<MessageRecord> {
        let message = self
            .http
            .post(format!("{}/messages/direct", self.base_url))
            .bearer_auth(&self.token)
            .json(&SendDirectMessageRequest {
                sender_id,
                receiver_id,
                body: body.clone(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    pub async fn send_group_message(
        &self,
        sender_id: UserId,
        group_id: GroupId,
        body: &MessageBody,
    ) -> Result<MessageRecord> {
        let form = reqwest::multipart::Form::new()
            .text("sender_id", sender_id.0.to_string())
            .text("body", serde_json::to_string(body)?);
        let message = self
            .http
            .post(format!("{}/groups/{}/messages", self.base_url, group_id.0))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    pub async fn join_group(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        self.http
            .post(format!("{}/groups/{}/members", self.base_url, group_id.0))
            .bearer_auth(&self.token)
            .query(&[("user_id", user_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn leave_group(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        self.http
            .delete(format!("{}/groups/{}/members", self.base_url, group_id.0))
            .bearer_auth(&self.token)
            .query(&[("user_id", user_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
