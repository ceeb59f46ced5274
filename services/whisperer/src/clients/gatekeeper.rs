use std::sync::Arc;

use async_trait::async_trait;
use auth::{LookupError, PermissionLookup, SESSION_TOKEN_HEADER, TokenProvider};
use discovery::HostGetter;
use schema::PermissionSet;

use super::{UpstreamError, endpoint};

const SERVICE: &str = "gatekeeper";

pub struct GatekeeperClient {
    hosts: Arc<dyn HostGetter>,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GatekeeperClient {
    pub fn new(
        hosts: Arc<dyn HostGetter>,
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            hosts,
            http,
            tokens,
        }
    }

    async fn fetch(&self, user_id: &str, group_id: &str) -> Result<PermissionSet, UpstreamError> {
        let server_token = self.tokens.server_token().ok_or(UpstreamError::MissingToken)?;
        let resp = self
            .http
            .get(endpoint(
                self.hosts.as_ref(),
                SERVICE,
                &["access", group_id, user_id],
            )?)
            .header(SESSION_TOKEN_HEADER, server_token)
            .send()
            .await?;
        match resp.status() {
            reqwest::StatusCode::OK => resp
                .json::<PermissionSet>()
                .await
                .map_err(|_| UpstreamError::InvalidResponse),
            // No relationship between the two users.
            reqwest::StatusCode::NOT_FOUND => Ok(PermissionSet::new()),
            status => Err(UpstreamError::BadStatus(status)),
        }
    }
}

#[async_trait]
impl PermissionLookup for GatekeeperClient {
    async fn user_in_group(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<PermissionSet, LookupError> {
        self.fetch(user_id, group_id).await.map_err(|err| match err {
            UpstreamError::Timeout => LookupError::Timeout,
            UpstreamError::BadStatus(status) => LookupError::BadStatus(status.as_u16()),
            UpstreamError::InvalidResponse => LookupError::InvalidResponse,
            other => LookupError::Unavailable(other.to_string()),
        })
    }
}
