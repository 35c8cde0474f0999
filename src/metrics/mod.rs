// Metrics module - defines the extensible architecture for metric collection
//
// This module provides the core trait that all collectors implement, the
// gauge sample type they emit, and the sink they emit into. New collector
// types are added by implementing `Collector` and registering a factory in
// `registry::CollectorRegistry::with_defaults`.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::HostConfig;
use crate::session::SessionCache;
use crate::xenapi::XenApiError;

pub mod host;
pub mod memory;
pub mod pool;
pub mod storage;

/// Errors a collector reports back to the scrape orchestrator
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("host {host}: {source}")]
    Host {
        host: String,
        #[source]
        source: XenApiError,
    },
}

/// One labelled gauge value
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub name: String,
    pub help: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Name, help text and label names of a gauge family
#[derive(Debug, Clone)]
pub struct GaugeDesc {
    name: String,
    help: String,
    label_names: Vec<&'static str>,
}

impl GaugeDesc {
    /// Builds `<namespace>_<subsystem>_<name>`, skipping empty parts
    pub fn new(
        namespace: &str,
        subsystem: &str,
        name: &str,
        help: &str,
        label_names: &[&'static str],
    ) -> Self {
        GaugeDesc {
            name: fq_name(namespace, subsystem, name),
            help: help.to_string(),
            label_names: label_names.to_vec(),
        }
    }

    /// Creates a sample; `label_values` pair up with the label names in order
    pub fn sample(&self, value: f64, label_values: &[&str]) -> GaugeSample {
        debug_assert_eq!(self.label_names.len(), label_values.len());
        GaugeSample {
            name: self.name.clone(),
            help: self.help.clone(),
            labels: self
                .label_names
                .iter()
                .zip(label_values)
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            value,
        }
    }
}

fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Where collectors write their samples
///
/// Cloned into every collector task of a scrape. Samples from one sender
/// arrive in the order they were emitted.
#[derive(Clone)]
pub struct MetricSink {
    tx: mpsc::UnboundedSender<GaugeSample>,
}

impl MetricSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GaugeSample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MetricSink { tx }, rx)
    }

    pub fn emit(&self, sample: GaugeSample) {
        // The receiver lives until every task of the scrape has joined.
        let _ = self.tx.send(sample);
    }
}

/// Everything a collector factory may need
#[derive(Clone)]
pub struct CollectorContext {
    pub namespace: String,
    pub hosts: Arc<Vec<HostConfig>>,
    pub sessions: Arc<SessionCache>,
}

/// Core trait that all collectors must implement.
///
/// A collector fetches one family group per scrape. It returns an error
/// when anything it needed failed; the orchestrator turns that into the
/// `collector_success` gauge instead of failing the whole scrape.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Registry name, also the `collector` label of the meta-metrics
    ///
    /// `CollectorRegistry::enable` refuses a factory whose collector reports
    /// a different name than the one it was registered under.
    fn name(&self) -> &str;

    /// Gets fresh values and writes them into `sink`
    async fn collect(&self, sink: &MetricSink) -> Result<(), CollectError>;
}

/// Runs a per-host query with the host's cached session
///
/// A `SESSION_INVALID` fault evicts the session so the next scrape logs in
/// again instead of failing forever.
pub(crate) async fn with_session<T, F, Fut>(
    sessions: &SessionCache,
    host: &HostConfig,
    query: F,
) -> Result<T, CollectError>
where
    F: FnOnce(crate::xenapi::XenClient) -> Fut,
    Fut: std::future::Future<Output = Result<T, XenApiError>>,
{
    let wrap = |source: XenApiError| CollectError::Host {
        host: host.host().to_string(),
        source,
    };

    let session = sessions.get(host).await.map_err(wrap)?;
    match query(session.client().clone()).await {
        Ok(value) => Ok(value),
        Err(e) => {
            if e.is_session_invalid() {
                sessions.evict(&session).await;
            }
            Err(wrap(e))
        }
    }
}
