use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use auth::{SESSION_TOKEN_HEADER, SessionValidator, TokenProvider};
use discovery::HostGetter;
use schema::TokenDescriptor;
use serde::Deserialize;
use tokio::task::JoinHandle;

use super::{SERVER_NAME_HEADER, SERVER_SECRET_HEADER, UpstreamError, endpoint};

const SERVICE: &str = "shoreline";
const LOGIN_RETRY: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct TokenData {
    #[serde(rename = "userid")]
    user_id: String,
    #[serde(rename = "isserver", default)]
    is_server: bool,
}

/// Session service client. Validates caller tokens and holds the gateway's
/// own server token, obtained by server login.
pub struct ShorelineClient {
    hosts: Arc<dyn HostGetter>,
    http: reqwest::Client,
    server_name: String,
    server_secret: String,
    token: RwLock<Option<String>>,
}

impl ShorelineClient {
    pub fn new(
        hosts: Arc<dyn HostGetter>,
        http: reqwest::Client,
        server_name: impl Into<String>,
        server_secret: impl Into<String>,
    ) -> Self {
        Self {
            hosts,
            http,
            server_name: server_name.into(),
            server_secret: server_secret.into(),
            token: RwLock::new(None),
        }
    }

    pub async fn login(&self) -> Result<(), UpstreamError> {
        let resp = self
            .http
            .post(endpoint(self.hosts.as_ref(), SERVICE, &["serverlogin"])?)
            .header(SERVER_NAME_HEADER, &self.server_name)
            .header(SERVER_SECRET_HEADER, &self.server_secret)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(UpstreamError::BadStatus(resp.status()));
        }
        let token = resp
            .headers()
            .get(SESSION_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or(UpstreamError::MissingToken)?
            .to_string();
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(())
    }

    /// `Ok(None)` when the session service does not recognise the token.
    pub async fn check_token(&self, token: &str) -> Result<Option<TokenDescriptor>, UpstreamError> {
        let server_token = self.server_token().ok_or(UpstreamError::MissingToken)?;
        let resp = self
            .http
            .get(endpoint(self.hosts.as_ref(), SERVICE, &["token", token])?)
            .header(SESSION_TOKEN_HEADER, server_token)
            .send()
            .await?;
        match resp.status() {
            reqwest::StatusCode::OK => {
                let data = resp
                    .json::<TokenData>()
                    .await
                    .map_err(|_| UpstreamError::InvalidResponse)?;
                Ok(Some(TokenDescriptor {
                    subject_user_id: data.user_id,
                    is_server: data.is_server,
                }))
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(UpstreamError::BadStatus(status)),
        }
    }

    /// Re-logs in every `refresh`, or every few seconds while no server
    /// token is held.
    pub fn spawn_token_refresh(self: &Arc<Self>, refresh: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = if client.server_token().is_some() {
                    refresh
                } else {
                    LOGIN_RETRY
                };
                tokio::time::sleep(wait).await;
                match client.login().await {
                    Ok(()) => tracing::debug!("server token refreshed"),
                    Err(err) => tracing::warn!(error = %err, "server login failed"),
                }
            }
        })
    }
}

#[async_trait]
impl SessionValidator for ShorelineClient {
    async fn validate(&self, token: &str) -> Option<TokenDescriptor> {
        match self.check_token(token).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::warn!(error = %err, "session token check failed");
                None
            }
        }
    }
}

impl TokenProvider for ShorelineClient {
    fn server_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
