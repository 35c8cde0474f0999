// JSON-RPC module - XenAPI transport over HTTPS
//
// XAPI serves JSON-RPC 2.0 at `/jsonrpc` next to its XML-RPC endpoint.
// Every call is a POST with positional parameters; the session reference,
// when needed, is the first parameter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{as_string, Connector, XenApiError, XenTransport};
use crate::config::HostConfig;

const API_VERSION: &str = "2.0";
const ORIGINATOR: &str = "xenstats-exporter";

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a [Value],
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Deserialize)]
struct RpcFault {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// JSON-RPC client for a single host
pub struct JsonRpcTransport {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            url: format!("{}/jsonrpc", base_url.trim_end_matches('/')),
            http,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl XenTransport for JsonRpcTransport {
    async fn login(&self, username: &str, password: &str) -> Result<String, XenApiError> {
        let method = "session.login_with_password";
        let params = vec![
            Value::from(username),
            Value::from(password),
            Value::from(API_VERSION),
            Value::from(ORIGINATOR),
        ];
        let value = self.call(method, params).await?;
        as_string(method, value)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, XenApiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params: &params,
            id,
        };

        debug!("XenAPI call #{} {} -> {}", id, method, self.url);

        let resp = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|source| XenApiError::Http {
                method: method.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(XenApiError::Status {
                method: method.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.text().await.map_err(|source| XenApiError::Http {
            method: method.to_string(),
            source,
        })?;

        decode_response(method, &body)
    }
}

/// Turns a JSON-RPC response body into the call's result value
fn decode_response(method: &str, body: &str) -> Result<Value, XenApiError> {
    let parsed: RpcResponse =
        serde_json::from_str(body).map_err(|e| XenApiError::Malformed {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

    if let Some(fault) = parsed.error {
        let details = match fault.data {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.to_string()],
        };
        return Err(XenApiError::Fault {
            method: method.to_string(),
            code: fault.message,
            details,
        });
    }

    Ok(parsed.result.unwrap_or(Value::Null))
}

/// Builds JSON-RPC transports sharing one HTTP connection pool
pub struct JsonRpcConnector {
    http: reqwest::Client,
}

impl JsonRpcConnector {
    /// # Arguments
    /// * `timeout` - Upper bound for every request, so a hung host cannot
    ///   stall its collector forever
    /// * `accept_invalid_certs` - Trust self-signed host certificates
    pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self, XenApiError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .build()
            .map_err(XenApiError::Client)?;

        Ok(Self { http })
    }
}

impl Connector for JsonRpcConnector {
    fn connect(&self, host: &HostConfig) -> Result<Arc<dyn XenTransport>, XenApiError> {
        let base_url = host.base_url();
        if reqwest::Url::parse(&base_url).is_err() {
            return Err(XenApiError::Connect {
                host: host.host().to_string(),
                reason: format!("invalid address '{}'", base_url),
            });
        }
        Ok(Arc::new(JsonRpcTransport::new(&base_url, self.http.clone())))
    }
}
