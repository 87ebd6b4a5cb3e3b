//! hyper-based client for the peer RPC routes.
//!
//! One HTTP/1 connection per call; peers talk rarely enough that pooling
//! is not worth the bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use provmon_state::{DeploymentRecord, PeerInfo, is_valid_name};

use crate::error::{PeerError, PeerResult};
use crate::event::DeploymentEvent;
use crate::rpc::{PeerConnector, PeerRpc};
use crate::server::ApiResponse;

const API_PREFIX: &str = "/api/v1";

pub struct HttpPeerClient {
    endpoint: String,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    /// `/peer/deployments/{name}` plus `suffix`. Names that are not path
    /// safe never leave this monitor.
    fn deployment_path(name: &str, suffix: &str) -> PeerResult<String> {
        if !is_valid_name(name) {
            return Err(PeerError::Codec(format!("deployment name {name:?} is not path safe")));
        }
        Ok(format!("/peer/deployments/{name}{suffix}"))
    }

    fn unreachable(&self, reason: impl ToString) -> PeerError {
        PeerError::Unreachable {
            peer: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> PeerResult<Option<T>> {
        self.call("GET", path, Bytes::new()).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> PeerResult<Option<T>> {
        let body = serde_json::to_vec(body).map_err(|e| PeerError::Codec(e.to_string()))?;
        self.call("POST", path, Bytes::from(body)).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Bytes,
    ) -> PeerResult<Option<T>> {
        let uri = format!("http://{}{API_PREFIX}{path}", self.endpoint);
        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.endpoint)
                .await
                .map_err(|e| self.unreachable(e))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| self.unreachable(e))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &self.endpoint)
                .header("content-type", "application/json")
                .header("user-agent", "provmon-peer/0.1")
                .body(Full::new(body))
                .map_err(|e| PeerError::Codec(e.to_string()))?;

            let resp = sender.send_request(req).await.map_err(|e| self.unreachable(e))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| self.unreachable(e))?
                .to_bytes();
            Ok::<_, PeerError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| self.unreachable(format!("no answer within {:?}", self.timeout)))??;
        debug!(%uri, %status, "peer call");

        let decoded: ApiResponse<T> = serde_json::from_slice(&bytes).map_err(|e| {
            if status.is_success() {
                PeerError::Codec(e.to_string())
            } else {
                PeerError::Rpc {
                    peer: self.endpoint.clone(),
                    message: format!("status {status}"),
                }
            }
        })?;

        if !status.is_success() || !decoded.success {
            return Err(PeerError::Rpc {
                peer: self.endpoint.clone(),
                message: decoded.error.unwrap_or_else(|| format!("status {status}")),
            });
        }
        Ok(decoded.data)
    }
}

/// Acknowledgement bodies are plain strings.
type Ack = String;

#[async_trait]
impl PeerRpc for HttpPeerClient {
    async fn peer_info(&self) -> PeerResult<PeerInfo> {
        self.get::<PeerInfo>("/peer/info")
            .await?
            .ok_or_else(|| PeerError::Codec("empty peer info".into()))
    }

    async fn assign_backup_for(&self, primary: PeerInfo) -> PeerResult<()> {
        self.post::<_, Ack>("/peer/backup", &primary).await.map(|_| ())
    }

    async fn remove_backup_for(&self, primary: PeerInfo) -> PeerResult<()> {
        self.post::<_, Ack>("/peer/backup/remove", &primary).await.map(|_| ())
    }

    async fn deployments(&self) -> PeerResult<Vec<DeploymentRecord>> {
        Ok(self
            .get::<Vec<DeploymentRecord>>("/peer/deployments")
            .await?
            .unwrap_or_default())
    }

    async fn deployment(&self, name: &str) -> PeerResult<Option<DeploymentRecord>> {
        Ok(self
            .get::<Option<DeploymentRecord>>(&Self::deployment_path(name, "")?)
            .await?
            .flatten())
    }

    async fn demote(&self, name: &str, winner: PeerInfo) -> PeerResult<()> {
        self.post::<_, Ack>(&Self::deployment_path(name, "/demote")?, &winner)
            .await
            .map(|_| ())
    }

    async fn notify(&self, event: DeploymentEvent) -> PeerResult<()> {
        self.post::<_, Ack>("/peer/events", &event).await.map(|_| ())
    }

    async fn update_peer_info(&self, info: PeerInfo) -> PeerResult<()> {
        self.post::<_, Ack>("/peer/info", &info).await.map(|_| ())
    }

    async fn ping(&self) -> PeerResult<()> {
        self.get::<Ack>("/peer/ping").await.map(|_| ())
    }
}

/// Hands out `HttpPeerClient`s.
#[derive(Debug, Clone, Copy)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PeerConnector for HttpConnector {
    async fn connect(&self, endpoint: &str) -> PeerResult<Arc<dyn PeerRpc>> {
        Ok(Arc::new(HttpPeerClient::new(endpoint, self.timeout)))
    }
}
