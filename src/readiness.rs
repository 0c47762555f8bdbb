//! Node readiness gate
//!
//! A node is usable once its management API answers `GET /pools` with 200.
//! Connection failures and non-200 answers both just mean "not yet".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::error::Result;
use crate::poll::{poll_until, PollOptions};

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Block until the node behind `endpoint` (e.g. `http://10.0.0.2:8091`) is
    /// ready, the wait bound expires or `cancel` fires.
    async fn wait_until_ready(&self, endpoint: &str, cancel: &CancellationToken) -> Result<()>;
}

pub struct HttpReadinessProbe {
    client: reqwest::Client,
    poll: PollOptions,
}

impl HttpReadinessProbe {
    pub fn new(poll: PollOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self { client, poll })
    }

    async fn is_ready(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                debug!(status = %response.status(), "node not ready yet");
                false
            }
            Err(e) => {
                debug!(error = %e, "node not reachable yet");
                false
            }
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn wait_until_ready(&self, endpoint: &str, cancel: &CancellationToken) -> Result<()> {
        let url = format!("{}/pools", endpoint.trim_end_matches('/'));
        let span = tracing::debug_span!("wait_until_ready", endpoint);

        async {
            let url = url.as_str();
            poll_until("node readiness", self.poll, cancel, move || async move {
                Ok(self.is_ready(url).await)
            })
            .await?;

            debug!("node is ready");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers 503 `failures` times, then 200
    async fn flaky_server(failures: u32) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let status = if counter.fetch_add(1, Ordering::SeqCst) < failures {
                    "503 Service Unavailable"
                } else {
                    "200 OK"
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn fast_poll() -> PollOptions {
        PollOptions::new(Duration::from_millis(10), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_waits_for_ok_status() {
        let (endpoint, hits) = flaky_server(2).await;
        let probe = HttpReadinessProbe::new(fast_poll()).unwrap();

        tokio_test::assert_ok!(
            probe
                .wait_until_ready(&endpoint, &CancellationToken::new())
                .await
        );

        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_node_times_out() {
        // bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpReadinessProbe::new(PollOptions::new(
            Duration::from_millis(10),
            Duration::from_millis(200),
        ))
        .unwrap();

        let err = probe
            .wait_until_ready(&format!("http://{}", addr), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_promptly() {
        let (endpoint, _) = flaky_server(u32::MAX).await;
        let probe = HttpReadinessProbe::new(fast_poll()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = tokio_test::assert_err!(probe.wait_until_ready(&endpoint, &cancel).await);
        assert!(err.is_cancelled());
    }
}
