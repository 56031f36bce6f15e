//! HTTP client for vLLM-style backends
//!
//! Talks to the sleep mode API:
//! - GET /health
//! - GET /is_sleeping -> {"is_sleeping": bool}
//! - POST /sleep?level={1,2}
//! - POST /wake_up

use super::{BackendClient, ClientError, Operation, SleepLevel};
use crate::backend::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type HyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Debug, Deserialize)]
struct IsSleepingResponse {
    is_sleeping: bool,
}

/// [`BackendClient`] backed by a pooled hyper client
///
/// Cloning is cheap and clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    client: HyperClient,
    request_timeout: Duration,
}

impl Default for HttpBackendClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HttpBackendClient {
    /// Every request is abandoned after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        let https = hyper_tls::HttpsConnector::new();

        debug!(timeout = ?request_timeout, "Creating backend HTTP client");

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .pool_timer(TokioTimer::new())
            .build(https);

        Self {
            client,
            request_timeout,
        }
    }

    async fn send(
        &self,
        op: Operation,
        endpoint: &Endpoint,
        method: Method,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(StatusCode, Bytes), ClientError> {
        let uri: hyper::Uri = endpoint
            .url(path)
            .parse()
            .map_err(|e| ClientError::transport(op, endpoint, format!("invalid url: {e}")))?;

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| ClientError::transport(op, endpoint, e))?;

        trace!(op = %op, endpoint = %endpoint, path, "Sending backend request");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ClientError::transport(op, endpoint, e))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::transport(op, endpoint, e))?
                .to_bytes();
            Ok((status, body))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::cancelled(op, endpoint)),
            result = tokio::time::timeout(self.request_timeout, exchange) => {
                result.unwrap_or_else(|_| {
                    Err(ClientError::transport(
                        op,
                        endpoint,
                        format!("timed out after {:?}", self.request_timeout),
                    ))
                })
            }
        }
    }

    fn expect_success(
        op: Operation,
        endpoint: &Endpoint,
        status: StatusCode,
        body: &Bytes,
    ) -> Result<(), ClientError> {
        if status.is_success() {
            return Ok(());
        }
        Err(ClientError::Status {
            op,
            endpoint: endpoint.clone(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn health(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<bool, ClientError> {
        let (status, _) = self
            .send(Operation::Health, endpoint, Method::GET, "/health", cancel)
            .await?;
        Ok(status.is_success())
    }

    async fn is_sleeping(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<bool, ClientError> {
        let op = Operation::IsSleeping;
        let (status, body) = self
            .send(op, endpoint, Method::GET, "/is_sleeping", cancel)
            .await?;
        Self::expect_success(op, endpoint, status, &body)?;

        let parsed: IsSleepingResponse =
            serde_json::from_slice(&body).map_err(|e| ClientError::Decode {
                op,
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        Ok(parsed.is_sleeping)
    }

    async fn sleep(
        &self,
        endpoint: &Endpoint,
        level: SleepLevel,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let op = Operation::Sleep;
        let path = format!("/sleep?level={}", level.as_u8());
        let (status, body) = self.send(op, endpoint, Method::POST, &path, cancel).await?;
        Self::expect_success(op, endpoint, status, &body)
    }

    async fn wake_up(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let op = Operation::WakeUp;
        let (status, body) = self
            .send(op, endpoint, Method::POST, "/wake_up", cancel)
            .await?;
        Self::expect_success(op, endpoint, status, &body)
    }
}
