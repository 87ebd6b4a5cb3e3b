//! Liveness probes and failure counting.
//!
//! A target is declared unreachable after a configurable number of
//! consecutive failed probes. Each failure doubles the probe interval up to
//! a cap; one successful probe resets both.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use provmon_core::ProbeKind;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered.
    Alive,
    /// The target answered with an error status.
    Rejected,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// What the tracker currently believes about a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Alive,
    Unreachable,
}

/// Tracks consecutive probe results for one target.
#[derive(Debug)]
pub struct LivenessTracker {
    state: Liveness,
    consecutive_failures: u32,
    unreachable_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl LivenessTracker {
    pub fn new(unreachable_threshold: u32, interval: Duration) -> Self {
        Self {
            state: Liveness::Unknown,
            consecutive_failures: 0,
            unreachable_threshold: unreachable_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: Duration::from_secs(60).max(interval),
        }
    }

    /// Record a probe result and return the new state.
    pub fn record(&mut self, result: ProbeResult) -> Liveness {
        match result {
            ProbeResult::Alive => {
                self.consecutive_failures = 0;
                self.current_backoff = self.base_interval;
                if self.state == Liveness::Unreachable {
                    debug!("target answering again");
                }
                self.state = Liveness::Alive;
            }
            ProbeResult::Rejected | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

                if self.consecutive_failures >= self.unreachable_threshold {
                    if self.state != Liveness::Unreachable {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unreachable_threshold,
                            "target unreachable"
                        );
                    }
                    self.state = Liveness::Unreachable;
                }
            }
        }
        self.state
    }

    pub fn state(&self) -> Liveness {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// One way of asking "is this endpoint still there?".
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeResult;
}

/// Plain TCP connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpHeartbeat;

#[async_trait]
impl LivenessCheck for TcpHeartbeat {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeResult {
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(endpoint)).await {
            Ok(Ok(_)) => ProbeResult::Alive,
            Ok(Err(e)) => {
                debug!(error = %e, %endpoint, "heartbeat connect failed");
                ProbeResult::Failed
            }
            Err(_) => {
                debug!(%endpoint, "heartbeat timed out");
                ProbeResult::Failed
            }
        }
    }
}

/// HTTP GET; any 2xx counts as alive.
#[derive(Debug, Clone)]
pub struct HttpCheck {
    path: String,
}

impl HttpCheck {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl LivenessCheck for HttpCheck {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn probe(&self, endpoint: &str, timeout: Duration) -> ProbeResult {
        let uri = format!("http://{endpoint}{}", self.path);

        let result = tokio::time::timeout(timeout, async {
            let stream = match tokio::net::TcpStream::connect(endpoint).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(error = %e, %uri, "probe connection failed");
                    return ProbeResult::Failed;
                }
            };

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, %uri, "probe handshake failed");
                    return ProbeResult::Failed;
                }
            };

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = match http::Request::builder()
                .method("GET")
                .uri(&uri)
                .header("host", endpoint)
                .header("user-agent", "provmon-health/0.1")
                .body(http_body_util::Empty::<bytes::Bytes>::new())
            {
                Ok(req) => req,
                Err(e) => {
                    debug!(error = %e, %uri, "probe request invalid");
                    return ProbeResult::Failed;
                }
            };

            match sender.send_request(req).await {
                Ok(resp) if resp.status().is_success() => ProbeResult::Alive,
                Ok(resp) => {
                    debug!(status = %resp.status(), %uri, "probe non-2xx");
                    ProbeResult::Rejected
                }
                Err(e) => {
                    debug!(error = %e, %uri, "probe request failed");
                    ProbeResult::Failed
                }
            }
        })
        .await;

        result.unwrap_or_else(|_| {
            debug!(%uri, "probe timed out");
            ProbeResult::Failed
        })
    }
}

/// Build the check named in the config file. `http_path` is only used by
/// the HTTP check.
pub fn check_for(kind: ProbeKind, http_path: &str) -> Arc<dyn LivenessCheck> {
    match kind {
        ProbeKind::Heartbeat => Arc::new(TcpHeartbeat),
        ProbeKind::Http => Arc::new(HttpCheck::new(http_path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_unknown() {
        let tracker = LivenessTracker::new(3, Duration::from_secs(5));
        assert_eq!(tracker.state(), Liveness::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_alive_on_first_success() {
        let mut tracker = LivenessTracker::new(3, Duration::from_secs(5));
        assert_eq!(tracker.record(ProbeResult::Alive), Liveness::Alive);
    }

    #[test]
    fn tracker_stays_alive_under_threshold() {
        let mut tracker = LivenessTracker::new(3, Duration::from_secs(5));
        tracker.record(ProbeResult::Alive);

        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Rejected);
        assert_eq!(tracker.state(), Liveness::Alive);
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn tracker_unreachable_at_threshold() {
        let mut tracker = LivenessTracker::new(3, Duration::from_secs(5));
        tracker.record(ProbeResult::Alive);

        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.record(ProbeResult::Failed), Liveness::Unreachable);
    }

    #[test]
    fn tracker_recovers_on_success() {
        let mut tracker = LivenessTracker::new(2, Duration::from_secs(1));
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.state(), Liveness::Unreachable);

        assert_eq!(tracker.record(ProbeResult::Alive), Liveness::Alive);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_exponential_backoff() {
        let mut tracker = LivenessTracker::new(3, Duration::from_secs(1));
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));

        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        tracker.record(ProbeResult::Alive);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn tracker_backoff_caps_at_max() {
        let mut tracker = LivenessTracker::new(100, Duration::from_secs(1));
        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        // 1 → 2 → 4 → 8 → 16 → 32 → 60 → 60 ...
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let mut tracker = LivenessTracker::new(0, Duration::from_secs(1));
        assert_eq!(tracker.record(ProbeResult::Failed), Liveness::Unreachable);
    }

    #[tokio::test]
    async fn heartbeat_to_closed_port_fails() {
        let result = TcpHeartbeat.probe("127.0.0.1:1", Duration::from_millis(200)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn heartbeat_to_listener_is_alive() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let result = TcpHeartbeat.probe(&addr, Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Alive);
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_fails() {
        let result = HttpCheck::new("/ping")
            .probe("127.0.0.1:1", Duration::from_millis(200))
            .await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[test]
    fn check_for_maps_config() {
        assert_eq!(check_for(ProbeKind::Heartbeat, "/").name(), "heartbeat");
        assert_eq!(check_for(ProbeKind::Http, "/").name(), "http");
    }
}
