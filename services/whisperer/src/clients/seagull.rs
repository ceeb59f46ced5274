use std::sync::Arc;

use async_trait::async_trait;
use auth::SESSION_TOKEN_HEADER;
use discovery::HostGetter;
use schema::GroupId;
use serde::Deserialize;

use super::{UpstreamError, endpoint};
use crate::groups::GroupResolver;

const SERVICE: &str = "seagull";

/// Private metadata entry the group id is stored under.
pub const UPLOADS_PAIR: &str = "uploads";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrivatePair {
    #[serde(rename = "id", alias = "ID")]
    pub id: String,
    #[serde(rename = "value", alias = "Value", default)]
    pub value: String,
}

pub struct SeagullClient {
    hosts: Arc<dyn HostGetter>,
    http: reqwest::Client,
}

impl SeagullClient {
    pub fn new(hosts: Arc<dyn HostGetter>, http: reqwest::Client) -> Self {
        Self { hosts, http }
    }

    pub async fn private_pair(
        &self,
        user_id: &str,
        hash_name: &str,
        token: &str,
    ) -> Result<PrivatePair, UpstreamError> {
        let resp = self
            .http
            .get(endpoint(
                self.hosts.as_ref(),
                SERVICE,
                &[user_id, "private", hash_name],
            )?)
            .header(SESSION_TOKEN_HEADER, token)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(UpstreamError::BadStatus(resp.status()));
        }
        resp.json::<PrivatePair>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)
    }
}

#[async_trait]
impl GroupResolver for SeagullClient {
    async fn resolve_group_id(&self, target_user_id: &str, server_token: &str) -> Option<GroupId> {
        match self
            .private_pair(target_user_id, UPLOADS_PAIR, server_token)
            .await
        {
            Ok(pair) if !pair.id.is_empty() => Some(GroupId::new(pair.id)),
            Ok(_) => {
                tracing::warn!(user = %target_user_id, "uploads pair has an empty id");
                None
            }
            Err(err) => {
                tracing::warn!(user = %target_user_id, error = %err, "uploads pair lookup failed");
                None
            }
        }
    }
}
