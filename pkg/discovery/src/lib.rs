use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

pub use reqwest::Url;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery request timed out")]
    Timeout,
    #[error("discovery HTTP error: {0}")]
    Http(reqwest::Error),
    #[error("discovery returned status {0}")]
    BadStatus(u16),
    #[error("discovery returned an invalid listing payload")]
    InvalidResponse,
    #[error("invalid service url {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            DiscoveryError::Timeout
        } else {
            DiscoveryError::Http(value)
        }
    }
}

fn default_protocol() -> String {
    "http".to_string()
}

/// One announced instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub service: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: String,
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ServiceListing {
    pub fn new(service: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            protocol: default_protocol(),
            host: host.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn url(&self) -> Result<Url, DiscoveryError> {
        let raw = format!("{}://{}", self.protocol, self.host);
        Url::parse(&raw).map_err(|_| DiscoveryError::InvalidUrl(raw))
    }
}

/// Source of base URLs for a collaborator service, best candidate first.
pub trait HostGetter: Send + Sync {
    fn hosts(&self) -> Vec<Url>;
}

#[derive(Debug, Clone)]
pub struct StaticHosts(Vec<Url>);

impl StaticHosts {
    pub fn new(hosts: Vec<Url>) -> Self {
        Self(hosts)
    }

    pub fn single(host: Url) -> Self {
        Self(vec![host])
    }
}

impl HostGetter for StaticHosts {
    fn hosts(&self) -> Vec<Url> {
        self.0.clone()
    }
}

type ListingCache = Arc<RwLock<HashMap<String, Vec<ServiceListing>>>>;

/// Client for a discovery coordinator. Listings fetched by `refresh` are
/// cached and served to `ServiceWatch` handles without further I/O.
#[derive(Clone)]
pub struct DiscoveryClient {
    coordinator: Url,
    http: reqwest::Client,
    listings: ListingCache,
}

impl DiscoveryClient {
    pub fn new(coordinator: Url, timeout: Duration) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DiscoveryError::Http)?;
        Ok(Self {
            coordinator,
            http,
            listings: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn fetch_listings(&self, service: &str) -> Result<Vec<ServiceListing>, DiscoveryError> {
        let resp = self
            .http
            .get(self.endpoint(&format!("v1/listings/{service}")))
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(DiscoveryError::BadStatus(resp.status().as_u16()));
        }
        resp.json::<Vec<ServiceListing>>()
            .await
            .map_err(|_| DiscoveryError::InvalidResponse)
    }

    /// Announces `listing` to the coordinator; the coordinator answers 201.
    pub async fn heartbeat(&self, listing: &ServiceListing) -> Result<(), DiscoveryError> {
        let resp = self
            .http
            .post(self.endpoint("v1/listings?heartbeat=true"))
            .json(listing)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::CREATED {
            return Err(DiscoveryError::BadStatus(resp.status().as_u16()));
        }
        Ok(())
    }

    /// Replaces the cached listings for `service`. On failure the previous
    /// listings stay in place.
    pub async fn refresh(&self, service: &str) -> Result<usize, DiscoveryError> {
        let listings = self.fetch_listings(service).await?;
        let count = listings.len();
        self.listings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), listings);
        Ok(count)
    }

    pub fn watch(&self, service: impl Into<String>) -> ServiceWatch {
        ServiceWatch {
            service: service.into(),
            listings: self.listings.clone(),
        }
    }

    pub fn spawn_polling(
        &self,
        services: Vec<String>,
        publish: Option<ServiceListing>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for service in &services {
                    match client.refresh(service).await {
                        Ok(count) => {
                            tracing::debug!(service = %service, listings = count, "discovery refreshed");
                        }
                        Err(err) => {
                            tracing::warn!(service = %service, error = %err, "discovery refresh failed");
                        }
                    }
                }
                if let Some(listing) = &publish
                    && let Err(err) = client.heartbeat(listing).await
                {
                    tracing::warn!(service = %listing.service, error = %err, "discovery heartbeat failed");
                }
            }
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.coordinator.as_str().trim_end_matches('/'), path)
    }
}

/// Host view over one service's cached listings.
#[derive(Clone)]
pub struct ServiceWatch {
    service: String,
    listings: ListingCache,
}

impl ServiceWatch {
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl HostGetter for ServiceWatch {
    fn hosts(&self) -> Vec<Url> {
        let cache = self.listings.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(&self.service)
            .map(|listings| {
                listings
                    .iter()
                    .filter_map(|listing| listing.url().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
