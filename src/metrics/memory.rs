// Host memory collector
//
// Reads total and free memory from each host's host_metrics object.
// XenAPI reports both in bytes.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{with_session, CollectError, Collector, CollectorContext, GaugeDesc, MetricSink};
use crate::config::HostConfig;
use crate::session::SessionCache;
use crate::xenapi::{XenApiError, XenClient};

const SUBSYSTEM: &str = "host";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMemoryMetrics {
    pub hostname: String,
    pub total_bytes: i64,
    pub free_bytes: i64,
}

impl HostMemoryMetrics {
    pub fn used_bytes(&self) -> i64 {
        self.total_bytes - self.free_bytes
    }
}

pub async fn query_host_memory(client: &XenClient) -> Result<Vec<HostMemoryMetrics>, XenApiError> {
    let hosts = client.get_all("host.get_all").await?;
    let mut results = Vec::with_capacity(hosts.len());

    for host_ref in &hosts {
        let hostname = client.get_string("host.get_name_label", host_ref).await?;
        let metrics_ref = client.get_string("host.get_metrics", host_ref).await?;
        let total_bytes = client
            .get_int("host_metrics.get_memory_total", &metrics_ref)
            .await?;
        let free_bytes = client
            .get_int("host_metrics.get_memory_free", &metrics_ref)
            .await?;

        debug!("{}: {} of {} bytes free", hostname, free_bytes, total_bytes);

        results.push(HostMemoryMetrics {
            hostname,
            total_bytes,
            free_bytes,
        });
    }

    Ok(results)
}

/// Publishes `host_memory_{total,free,used}_bytes` per host
pub struct MemoryCollector {
    hosts: Arc<Vec<HostConfig>>,
    sessions: Arc<SessionCache>,
    total: GaugeDesc,
    free: GaugeDesc,
    used: GaugeDesc,
}

impl MemoryCollector {
    pub const NAME: &'static str = "memory";

    pub fn new(ctx: &CollectorContext) -> Self {
        let desc = |name, help| GaugeDesc::new(&ctx.namespace, SUBSYSTEM, name, help, &["hostname"]);

        MemoryCollector {
            hosts: ctx.hosts.clone(),
            sessions: ctx.sessions.clone(),
            total: desc("memory_total_bytes", "Total memory on the Xenhost"),
            free: desc("memory_free_bytes", "Free memory on the Xenhost"),
            used: desc("memory_used_bytes", "Used memory on the Xenhost"),
        }
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn collect(&self, sink: &MetricSink) -> Result<(), CollectError> {
        for host in self.hosts.iter() {
            let metrics = with_session(&self.sessions, host, |client| async move {
                query_host_memory(&client).await
            })
            .await?;

            for m in &metrics {
                let labels = [m.hostname.as_str()];
                sink.emit(self.total.sample(m.total_bytes as f64, &labels));
                sink.emit(self.free.sample(m.free_bytes as f64, &labels));
                sink.emit(self.used.sample(m.used_bytes() as f64, &labels));
            }
        }
        Ok(())
    }
}
