// Host CPU collector
//
// Counts physical CPUs per host and the virtual CPUs handed out to tenant
// VMs resident on it. Control-domain VMs (dom0) are the hypervisor's own
// management overhead and are left out of the "used" count.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{with_session, CollectError, Collector, CollectorContext, GaugeDesc, MetricSink};
use crate::config::HostConfig;
use crate::session::SessionCache;
use crate::xenapi::{XenApiError, XenClient};

const SUBSYSTEM: &str = "host";

/// CPU accounting for one host
///
/// `cpus_free` is `cpus_total - cpus_used` and goes negative when the host
/// is over-committed. It is never clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCpuMetrics {
    pub hostname: String,
    pub cpus_total: i64,
    pub cpus_used: i64,
    pub cpus_free: i64,
}

/// Computes CPU totals for every host visible to the session
///
/// # Algorithm
/// For each host from `host.get_all`:
/// 1. Resolve its name label
/// 2. Count its physical CPUs
/// 3. Sum `VCPUs_number` over resident VMs that are not control domains
///
/// # Errors
/// Any failed call, or a vCPU count that is not an integer, aborts the whole
/// query. Skipping a VM would understate the used count.
pub async fn query_host_cpu(client: &XenClient) -> Result<Vec<HostCpuMetrics>, XenApiError> {
    let hosts = client.get_all("host.get_all").await?;
    let mut results = Vec::with_capacity(hosts.len());

    for host_ref in &hosts {
        let hostname = client.get_string("host.get_name_label", host_ref).await?;
        let cpus_total = client.get_refs("host.get_host_CPUs", host_ref).await?.len() as i64;
        let vms = client.get_refs("host.get_resident_VMs", host_ref).await?;

        let mut cpus_used = 0i64;
        for vm_ref in &vms {
            if client.get_bool("VM.get_is_control_domain", vm_ref).await? {
                continue;
            }
            let metrics_ref = client.get_string("VM.get_metrics", vm_ref).await?;
            cpus_used += client
                .get_int("VM_metrics.get_VCPUs_number", &metrics_ref)
                .await?;
        }

        debug!(
            "{}: {} pCPUs, {} vCPUs over {} resident VMs",
            hostname,
            cpus_total,
            cpus_used,
            vms.len()
        );

        results.push(HostCpuMetrics {
            hostname,
            cpus_total,
            cpus_used,
            cpus_free: cpus_total - cpus_used,
        });
    }

    Ok(results)
}

/// Publishes `host_cpus_total`, `host_cpus_used` and `host_cpus_free`
///
/// Iterates over every configured host in order. Each host's samples are
/// emitted only once its whole query succeeded.
pub struct HostCollector {
    hosts: Arc<Vec<HostConfig>>,
    sessions: Arc<SessionCache>,
    cpus_total: GaugeDesc,
    cpus_used: GaugeDesc,
    cpus_free: GaugeDesc,
}

impl HostCollector {
    pub const NAME: &'static str = "host";

    pub fn new(ctx: &CollectorContext) -> Self {
        let desc = |name, help| GaugeDesc::new(&ctx.namespace, SUBSYSTEM, name, help, &["hostname"]);

        HostCollector {
            hosts: ctx.hosts.clone(),
            sessions: ctx.sessions.clone(),
            cpus_total: desc("cpus_total", "Total number of CPU cores on the Xenhost"),
            cpus_used: desc("cpus_used", "Used CPU cores on the Xenhost"),
            cpus_free: desc("cpus_free", "Free CPU cores on the Xenhost"),
        }
    }
}

#[async_trait]
impl Collector for HostCollector {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn collect(&self, sink: &MetricSink) -> Result<(), CollectError> {
        for host in self.hosts.iter() {
            let metrics = with_session(&self.sessions, host, |client| async move {
                query_host_cpu(&client).await
            })
            .await?;

            for m in &metrics {
                let labels = [m.hostname.as_str()];
                sink.emit(self.cpus_total.sample(m.cpus_total as f64, &labels));
                sink.emit(self.cpus_used.sample(m.cpus_used as f64, &labels));
                sink.emit(self.cpus_free.sample(m.cpus_free as f64, &labels));
            }
        }
        Ok(())
    }
}
