//! Network reachability probes used by readiness checks.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

use crate::errors::ChannelError;

/// Answers "is this port open" and "what does this URL return".
#[async_trait]
pub trait Reachability: Send + Sync + fmt::Debug {
    async fn port_open(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// HTTP status of a GET. Any status is `Ok`; `Err` means no response.
    async fn http_status(&self, url: &str, timeout: Duration) -> Result<u16, ChannelError>;
}

/// Real sockets and a certificate-agnostic HTTP client.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    client: reqwest::Client,
}

impl NetworkProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Appliances ship self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Reachability for NetworkProbe {
    async fn port_open(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let open = matches!(
            tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        );
        trace!(host, port, open, "Port probe");
        open
    }

    async fn http_status(&self, url: &str, timeout: Duration) -> Result<u16, ChannelError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ChannelError::Http {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_port_open_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = NetworkProbe::new().unwrap();

        assert!(probe.port_open("127.0.0.1", port, Duration::from_secs(2)).await);
        drop(listener);
        assert!(!probe.port_open("127.0.0.1", port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_http_status_without_listener_names_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let network = NetworkProbe::new().unwrap();
        let url = format!("http://127.0.0.1:{port}/");

        let err = network.http_status(&url, Duration::from_secs(2)).await.unwrap_err();
        match err {
            ChannelError::Http { url: failed, .. } => assert_eq!(failed, url),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
