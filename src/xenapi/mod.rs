// XenAPI module - typed access to the hypervisor management API
//
// The collectors never see raw RPC values. A `XenTransport` moves JSON
// values over the wire; `XenClient` binds a transport to an authenticated
// session and converts every response into the shape the caller asked for
// (string, boolean, integer, list of references) exactly once.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::config::HostConfig;

pub mod jsonrpc;

#[cfg(test)]
pub mod fake;

/// Fault code XenAPI returns for an expired or unknown session reference
pub const SESSION_INVALID: &str = "SESSION_INVALID";

/// Errors raised by XenAPI calls
///
/// Every variant that stems from a single RPC carries the method name so
/// a failed scrape points at the call that broke it.
#[derive(Error, Debug)]
pub enum XenApiError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("XEN Api Error: {method} request failed: {source}")]
    Http {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("XEN Api Error: {method} returned HTTP {status}")]
    Status { method: String, status: u16 },

    #[error("XEN Api Error: {method} failed with {code} {details:?}")]
    Fault {
        method: String,
        code: String,
        details: Vec<String>,
    },

    #[error("XEN Api Error: malformed response to {method}: {reason}")]
    Malformed { method: String, reason: String },

    #[error("XEN Api Error: {method} returned {found}, expected {expected}")]
    UnexpectedType {
        method: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("value conversion error: {method} returned {value:?}, not an integer")]
    InvalidInteger { method: String, value: String },
}

impl XenApiError {
    /// True when the host rejected the session reference itself
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, XenApiError::Fault { code, .. } if code == SESSION_INVALID)
    }
}

/// Wire-level access to one host's management API
#[async_trait]
pub trait XenTransport: Send + Sync {
    /// Authenticates and returns the opaque session reference
    async fn login(&self, username: &str, password: &str) -> Result<String, XenApiError>;

    /// Invokes `method` with positional parameters and returns the raw result
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, XenApiError>;

    async fn logout(&self, session_ref: &str) -> Result<(), XenApiError> {
        self.call("session.logout", vec![Value::from(session_ref)])
            .await
            .map(|_| ())
    }
}

/// Creates transports for configured hosts
///
/// Injected into the session cache so tests can substitute a fake API.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &HostConfig) -> Result<Arc<dyn XenTransport>, XenApiError>;
}

/// A transport bound to an authenticated session
#[derive(Clone)]
pub struct XenClient {
    transport: Arc<dyn XenTransport>,
    session_ref: String,
}

impl XenClient {
    pub fn new(transport: Arc<dyn XenTransport>, session_ref: String) -> Self {
        XenClient {
            transport,
            session_ref,
        }
    }

    pub fn session_ref(&self) -> &str {
        &self.session_ref
    }

    async fn call(&self, method: &str, obj_ref: Option<&str>) -> Result<Value, XenApiError> {
        let mut params = vec![Value::from(self.session_ref())];
        if let Some(obj_ref) = obj_ref {
            params.push(Value::from(obj_ref));
        }
        self.transport.call(method, params).await
    }

    /// Lists every object of a class, e.g. `host.get_all`
    pub async fn get_all(&self, method: &str) -> Result<Vec<String>, XenApiError> {
        let value = self.call(method, None).await?;
        as_refs(method, value)
    }

    /// Calls a getter returning a list of object references
    pub async fn get_refs(&self, method: &str, obj_ref: &str) -> Result<Vec<String>, XenApiError> {
        let value = self.call(method, Some(obj_ref)).await?;
        as_refs(method, value)
    }

    pub async fn get_string(&self, method: &str, obj_ref: &str) -> Result<String, XenApiError> {
        let value = self.call(method, Some(obj_ref)).await?;
        as_string(method, value)
    }

    pub async fn get_bool(&self, method: &str, obj_ref: &str) -> Result<bool, XenApiError> {
        let value = self.call(method, Some(obj_ref)).await?;
        as_bool(method, value)
    }

    /// Calls a getter returning an int64
    ///
    /// XenAPI encodes int64 values as decimal strings on some transports, so
    /// both JSON numbers and decimal text are accepted. Anything else is an
    /// error, never a silent zero.
    pub async fn get_int(&self, method: &str, obj_ref: &str) -> Result<i64, XenApiError> {
        let value = self.call(method, Some(obj_ref)).await?;
        as_int(method, value)
    }

    /// Cheap authenticated round trip used to check a cached session
    pub async fn ping(&self) -> Result<(), XenApiError> {
        let value = self.call("session.get_this_host", Some(self.session_ref())).await?;
        as_string("session.get_this_host", value).map(|_| ())
    }

    pub async fn logout(&self) -> Result<(), XenApiError> {
        self.transport.logout(self.session_ref()).await
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn unexpected(method: &str, expected: &'static str, found: &Value) -> XenApiError {
    XenApiError::UnexpectedType {
        method: method.to_string(),
        expected,
        found: kind(found),
    }
}

pub(crate) fn as_string(method: &str, value: Value) -> Result<String, XenApiError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(unexpected(method, "string", &other)),
    }
}

pub(crate) fn as_bool(method: &str, value: Value) -> Result<bool, XenApiError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(unexpected(method, "boolean", &other)),
    }
}

pub(crate) fn as_int(method: &str, value: Value) -> Result<i64, XenApiError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| XenApiError::InvalidInteger {
            method: method.to_string(),
            value: n.to_string(),
        }),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| XenApiError::InvalidInteger {
                method: method.to_string(),
                value: s,
            }),
        other => Err(unexpected(method, "integer", &other)),
    }
}

pub(crate) fn as_refs(method: &str, value: Value) -> Result<Vec<String>, XenApiError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(unexpected(method, "list of references", &other)),
            })
            .collect(),
        other => Err(unexpected(method, "list of references", &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_int_accepts_numbers_and_text() {
        assert_eq!(as_int("m", json!(4)).unwrap(), 4);
        assert_eq!(as_int("m", json!("12")).unwrap(), 12);
        assert_eq!(as_int("m", json!(" 3 ")).unwrap(), 3);
    }

    #[test]
    fn test_as_int_rejects_garbage() {
        let err = as_int("VM_metrics.get_VCPUs_number", json!("four")).unwrap_err();
        match err {
            XenApiError::InvalidInteger { method, value } => {
                assert_eq!(method, "VM_metrics.get_VCPUs_number");
                assert_eq!(value, "four");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(as_int("m", json!(2.5)).is_err());
        assert!(as_int("m", json!(null)).is_err());
    }

    #[test]
    fn test_as_refs() {
        let refs = as_refs("host.get_all", json!(["OpaqueRef:a", "OpaqueRef:b"])).unwrap();
        assert_eq!(refs, vec!["OpaqueRef:a", "OpaqueRef:b"]);

        let err = as_refs("host.get_all", json!(["OpaqueRef:a", 1])).unwrap_err();
        assert!(err.to_string().contains("host.get_all"));
        assert!(as_refs("host.get_all", json!("OpaqueRef:a")).is_err());
    }

    #[test]
    fn test_type_mismatch_names_method() {
        let err = as_bool("VM.get_is_control_domain", json!("true")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "XEN Api Error: VM.get_is_control_domain returned string, expected boolean"
        );
        assert!(as_string("host.get_name_label", json!(1)).is_err());
    }

    #[test]
    fn test_session_invalid_detection() {
        let err = XenApiError::Fault {
            method: "host.get_all".to_string(),
            code: SESSION_INVALID.to_string(),
            details: vec!["OpaqueRef:dead".to_string()],
        };
        assert!(err.is_session_invalid());

        let other = XenApiError::Fault {
            method: "host.get_all".to_string(),
            code: "HANDLE_INVALID".to_string(),
            details: vec![],
        };
        assert!(!other.is_session_invalid());
    }
}
