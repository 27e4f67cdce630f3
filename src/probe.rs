//! Reachability checks for helper instances.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::trace;

/// Boxed future returned by [`ReachabilityProbe::is_reachable`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Checks whether a helper instance accepts connections.
pub trait ReachabilityProbe {
    /// Returns `true` once `host` accepts a TCP connection on `port`.
    fn is_reachable<'a>(&'a self, host: &'a str, port: u16) -> ProbeFuture<'a>;
}

/// Probe that attempts a TCP connection with a short timeout.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl TcpProbe {
    /// Creates a probe that gives up on each connection attempt after
    /// `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ReachabilityProbe for TcpProbe {
    fn is_reachable<'a>(&'a self, host: &'a str, port: u16) -> ProbeFuture<'a> {
        Box::pin(async move {
            let attempt = tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await;
            let reachable = matches!(attempt, Ok(Ok(_)));
            trace!(host, port, reachable, "probed helper");
            reachable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listening_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        let port = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("local addr: {err}"))
            .port();

        assert!(TcpProbe::default().is_reachable("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        let port = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("local addr: {err}"))
            .port();
        drop(listener);

        let probe = TcpProbe::new(Duration::from_millis(200));
        assert!(!probe.is_reachable("127.0.0.1", port).await);
    }
}
