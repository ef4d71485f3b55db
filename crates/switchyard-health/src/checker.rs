//! Usage probe logic.
//!
//! Polls an instance's HTTP usage endpoint for its resource usage and
//! tracks consecutive failures with exponential backoff.

use std::time::Duration;

use http_body_util::BodyExt;
use tracing::{debug, warn};

use switchyard_core::ResourceUsage;

/// Result of a single usage probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx with a usage document.
    Reported(ResourceUsage),
    /// The endpoint returned non-2xx or an unreadable body.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Reporting state of one instance as seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportingStatus {
    /// No probe has completed yet.
    Unknown,
    Reporting,
    /// `unhealthy_threshold` consecutive probes failed.
    Failing,
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct UsageTracker {
    status: ReportingStatus,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl UsageTracker {
    pub fn new(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self {
            status: ReportingStatus::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: Duration::from_secs(60).max(interval),
        }
    }

    /// Record a probe result and return the new reporting status.
    pub fn record(&mut self, result: &ProbeResult) -> ReportingStatus {
        match result {
            ProbeResult::Reported(_) => {
                if self.status == ReportingStatus::Failing {
                    debug!(
                        failures = self.consecutive_failures,
                        "instance resumed reporting usage"
                    );
                }
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                self.status = ReportingStatus::Reporting;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                // Exponential backoff: double the interval up to max.
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != ReportingStatus::Failing
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "instance stopped reporting usage"
                    );
                    self.status = ReportingStatus::Failing;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> ReportingStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe of this instance.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// GET `http://{authority}{path}` and parse the body as [`ResourceUsage`].
pub async fn http_usage_probe(authority: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{authority}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(authority).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "usage probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "usage probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method(http::Method::GET)
            .uri(&uri)
            .header(http::header::HOST, authority)
            .header(http::header::USER_AGENT, "switchyard-health/0.1")
            .header(http::header::ACCEPT, "application/json")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "usage probe request invalid");
                return ProbeResult::Failed;
            }
        };

        let resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, %uri, "usage probe request failed");
                return ProbeResult::Failed;
            }
        };

        if !resp.status().is_success() {
            debug!(status = %resp.status(), %uri, "usage probe non-2xx");
            return ProbeResult::Unhealthy;
        }

        let body = match resp.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, %uri, "usage probe body read failed");
                return ProbeResult::Failed;
            }
        };

        match serde_json::from_slice::<ResourceUsage>(&body) {
            Ok(usage) => ProbeResult::Reported(usage),
            Err(e) => {
                debug!(error = %e, %uri, "usage probe body is not a usage document");
                ProbeResult::Unhealthy
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "usage probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a fixed HTTP response to every connection. Returns `host:port`.
    pub async fn serve(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    /// An address nothing listens on.
    pub async fn closed_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reported() -> ProbeResult {
        ProbeResult::Reported(ResourceUsage::default())
    }

    #[test]
    fn tracker_starts_unknown() {
        let tracker = UsageTracker::new(3, Duration::from_secs(5));
        assert_eq!(tracker.status(), ReportingStatus::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_fails_at_threshold() {
        let mut tracker = UsageTracker::new(3, Duration::from_secs(5));
        tracker.record(&reported());

        tracker.record(&ProbeResult::Unhealthy);
        tracker.record(&ProbeResult::Failed);
        assert_eq!(tracker.status(), ReportingStatus::Reporting);

        assert_eq!(tracker.record(&ProbeResult::Failed), ReportingStatus::Failing);
        assert_eq!(tracker.consecutive_failures(), 3);
    }

    #[test]
    fn tracker_success_resets_failures() {
        let mut tracker = UsageTracker::new(3, Duration::from_secs(5));
        tracker.record(&ProbeResult::Failed);
        tracker.record(&ProbeResult::Failed);
        tracker.record(&reported());
        tracker.record(&ProbeResult::Failed);
        assert_eq!(tracker.status(), ReportingStatus::Reporting);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn tracker_backoff_doubles_and_caps() {
        let mut tracker = UsageTracker::new(100, Duration::from_secs(1));
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));

        tracker.record(&ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(&ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            tracker.record(&ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));

        tracker.record(&reported());
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_threshold_behaves_as_one() {
        let mut tracker = UsageTracker::new(0, Duration::from_secs(1));
        assert_eq!(tracker.record(&ProbeResult::Failed), ReportingStatus::Failing);
    }

    #[tokio::test]
    async fn probe_parses_usage() {
        let addr = test_server::serve(
            "200 OK",
            r#"{"cpu":42.5,"memory":30,"connections":4,"throughput":12}"#,
        )
        .await;

        let result = http_usage_probe(&addr, "/usage", Duration::from_secs(2)).await;
        let ProbeResult::Reported(usage) = result else {
            panic!("expected a report, got {result:?}");
        };
        assert_eq!(usage.cpu, 42.5);
        assert_eq!(usage.connections, 4);
    }

    #[tokio::test]
    async fn probe_non_2xx_is_unhealthy() {
        let addr = test_server::serve("503 Service Unavailable", "{}").await;
        assert_eq!(
            http_usage_probe(&addr, "/usage", Duration::from_secs(2)).await,
            ProbeResult::Unhealthy
        );
    }

    #[tokio::test]
    async fn probe_bad_body_is_unhealthy() {
        let addr = test_server::serve("200 OK", "not json").await;
        assert_eq!(
            http_usage_probe(&addr, "/usage", Duration::from_secs(2)).await,
            ProbeResult::Unhealthy
        );
    }

    #[tokio::test]
    async fn probe_connection_refused_fails() {
        let addr = test_server::closed_addr().await;
        assert_eq!(
            http_usage_probe(&addr, "/usage", Duration::from_secs(2)).await,
            ProbeResult::Failed
        );
    }
}
