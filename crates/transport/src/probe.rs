//! Connectivity probes

use crate::{Connectivity, ConnectivityProbe};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Probe that always reports online. The transport call itself surfaces
/// connectivity failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn check(&self) -> Pin<Box<dyn Future<Output = Connectivity> + Send + '_>> {
        Box::pin(async { Connectivity::ONLINE })
    }
}

/// Probe driven by the host application, e.g. from OS reachability callbacks.
#[derive(Debug)]
pub struct ManualProbe {
    connected: AtomicBool,
}

impl ManualProbe {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for ManualProbe {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityProbe for ManualProbe {
    fn check(&self) -> Pin<Box<dyn Future<Output = Connectivity> + Send + '_>> {
        let connected = self.connected.load(Ordering::SeqCst);
        Box::pin(async move { Connectivity { connected } })
    }
}

/// Probe that opens (and immediately closes) a TCP connection to `addr`.
///
/// `addr` is anything `TcpStream::connect` accepts, typically the API host
/// with its port (`api.example.com:443`).
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

impl ConnectivityProbe for TcpProbe {
    fn check(&self) -> Pin<Box<dyn Future<Output = Connectivity> + Send + '_>> {
        Box::pin(async move {
            let connected =
                match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
                    Ok(Ok(_stream)) => true,
                    Ok(Err(e)) => {
                        debug!(addr = %self.addr, error = %e, "connectivity probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(addr = %self.addr, timeout_ms = self.timeout.as_millis() as u64, "connectivity probe timed out");
                        false
                    }
                };
            Connectivity { connected }
        })
    }
}
