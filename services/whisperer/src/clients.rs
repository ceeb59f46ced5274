pub mod gatekeeper;
pub mod seagull;
pub mod shoreline;

use std::time::Duration;

use discovery::{HostGetter, Url};

pub use gatekeeper::GatekeeperClient;
pub use seagull::SeagullClient;
pub use shoreline::ShorelineClient;

pub const SERVER_NAME_HEADER: &str = "x-tidepool-server-name";
pub const SERVER_SECRET_HEADER: &str = "x-tidepool-server-secret";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("no host available for {0}")]
    NoHost(&'static str),
    #[error("host for {0} cannot carry a path")]
    BadHost(&'static str),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream HTTP error: {0}")]
    Http(reqwest::Error),
    #[error("upstream returned status {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("upstream returned an invalid response body")]
    InvalidResponse,
    #[error("upstream response carried no session token")]
    MissingToken,
}

impl From<reqwest::Error> for UpstreamError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Http(value)
        }
    }
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(UpstreamError::Http)
}

/// Appends `segments` to the first host `hosts` offers. Each segment is
/// percent-encoded, so caller-supplied ids stay inside their own segment.
fn endpoint(
    hosts: &dyn HostGetter,
    service: &'static str,
    segments: &[&str],
) -> Result<Url, UpstreamError> {
    let mut url = hosts
        .hosts()
        .into_iter()
        .next()
        .ok_or(UpstreamError::NoHost(service))?;
    url.path_segments_mut()
        .map_err(|()| UpstreamError::BadHost(service))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
