use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use url::Url;

/// Single point-in-time reachability query.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> impl Future<Output = bool> + Send;
}

/// Reports online when one TCP connect to the API host succeeds in time.
#[derive(Debug, Clone)]
pub struct TcpCheck {
    addr: String,
    timeout: Duration,
}

impl TcpCheck {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Check against the host and port the API base URL points at.
    pub fn for_base_url(base_url: &Url, timeout: Duration) -> Option<Self> {
        let host = base_url.host_str()?;
        let port = base_url.port_or_known_default()?;
        Some(Self::new(format!("{host}:{port}"), timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connectivity for TcpCheck {
    async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                tracing::debug!(addr = %self.addr, "connectivity check failed: {err}");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, "connectivity check timed out");
                false
            }
        }
    }
}

/// Switchable reachability, used for forced offline mode.
#[derive(Debug)]
pub struct ManualConnectivity {
    online: AtomicBool,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for ManualConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// The connectivity source picked at startup.
#[derive(Debug)]
pub enum NetworkMonitor {
    Tcp(TcpCheck),
    Manual(ManualConnectivity),
}

impl Connectivity for NetworkMonitor {
    async fn is_online(&self) -> bool {
        match self {
            NetworkMonitor::Tcp(check) => check.is_online().await,
            NetworkMonitor::Manual(manual) => manual.is_online().await,
        }
    }
}
