//! Network reachability probing.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

use camsync_common::{ConnectivityState, Error, Result};

/// A single bounded reachability check.
///
/// Implementations must return within their own timeout; an unanswered probe
/// counts as `Offline`.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> ConnectivityState;
}

/// Probe that issues a GET against a well-known URL.
pub struct HttpProbe {
    http: Client,
    url: Url,
}

impl HttpProbe {
    /// Create a probe for `url` with the given request timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid probe url {:?}: {}", url, e)))?;
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> ConnectivityState {
        match self.http.get(self.url.clone()).send().await {
            Ok(response) if response.status().is_success() => ConnectivityState::Online,
            Ok(response) => {
                debug!("Probe {} answered {}", self.url, response.status());
                ConnectivityState::Offline
            }
            Err(e) => {
                debug!("Probe {} failed: {}", self.url, e);
                ConnectivityState::Offline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        assert!(HttpProbe::new("::nope", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_probe_is_offline() {
        let probe = HttpProbe::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        assert_eq!(probe.probe().await, ConnectivityState::Offline);
    }
}
