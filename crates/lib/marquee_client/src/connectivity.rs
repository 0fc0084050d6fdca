//! Online detection: the platform's network signal confirmed by a probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

/// Reachability probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// `GET /health` on the server.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: Url,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(base_url: &Url) -> Result<Self, url::ParseError> {
        Ok(Self {
            url: base_url.join("health")?,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.get(self.url.clone()).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("reachability probe failed: {e}");
                false
            }
        }
    }
}

/// Shared by every tenant queue on the terminal.
#[derive(Clone)]
pub struct Connectivity {
    os_online: Arc<watch::Sender<bool>>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl Connectivity {
    /// Starts out online according to the platform.
    pub fn new(probe: Arc<dyn ReachabilityProbe>) -> Self {
        let (tx, _) = watch::channel(true);
        Self {
            os_online: Arc::new(tx),
            probe,
        }
    }

    /// Feed the platform's online/offline signal.
    pub fn set_os_online(&self, online: bool) {
        let previous = self.os_online.send_replace(online);
        if previous != online {
            debug!(online, "network signal changed");
        }
    }

    pub fn os_online(&self) -> bool {
        *self.os_online.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.os_online.subscribe()
    }

    /// Online only when the platform says so and the server answers.
    pub async fn check(&self) -> bool {
        self.os_online() && self.probe.is_reachable().await
    }
}
