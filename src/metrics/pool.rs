// Pool collector
//
// Reports high-availability state and the master of every pool a configured
// host belongs to. A standalone host is a pool of one whose name label is
// usually empty; the master's hostname stands in for it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{with_session, CollectError, Collector, CollectorContext, GaugeDesc, MetricSink};
use crate::config::HostConfig;
use crate::session::SessionCache;
use crate::xenapi::{XenApiError, XenClient};

const SUBSYSTEM: &str = "pool";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    pub name: String,
    pub master: String,
    pub ha_enabled: bool,
    pub hosts: usize,
}

pub async fn query_pools(client: &XenClient) -> Result<Vec<PoolMetrics>, XenApiError> {
    let pools = client.get_all("pool.get_all").await?;
    if pools.is_empty() {
        return Ok(Vec::new());
    }

    // Every host a session sees belongs to the session's pool.
    let hosts = client.get_all("host.get_all").await?.len();
    let mut results = Vec::with_capacity(pools.len());

    for pool_ref in &pools {
        let label = client.get_string("pool.get_name_label", pool_ref).await?;
        let ha_enabled = client.get_bool("pool.get_ha_enabled", pool_ref).await?;
        let master_ref = client.get_string("pool.get_master", pool_ref).await?;
        let master = client.get_string("host.get_name_label", &master_ref).await?;

        let name = if label.is_empty() { master.clone() } else { label };
        debug!("pool {}: master {}, HA enabled: {}", name, master, ha_enabled);

        results.push(PoolMetrics {
            name,
            master,
            ha_enabled,
            hosts,
        });
    }

    Ok(results)
}

/// Publishes `pool_ha_enabled`, `pool_hosts` and `pool_master_info`
pub struct PoolCollector {
    hosts: Arc<Vec<HostConfig>>,
    sessions: Arc<SessionCache>,
    ha_enabled: GaugeDesc,
    members: GaugeDesc,
    master: GaugeDesc,
}

impl PoolCollector {
    pub const NAME: &'static str = "pool";

    pub fn new(ctx: &CollectorContext) -> Self {
        PoolCollector {
            hosts: ctx.hosts.clone(),
            sessions: ctx.sessions.clone(),
            ha_enabled: GaugeDesc::new(
                &ctx.namespace,
                SUBSYSTEM,
                "ha_enabled",
                "Whether high availability is enabled on the pool",
                &["xenhost", "pool"],
            ),
            members: GaugeDesc::new(
                &ctx.namespace,
                SUBSYSTEM,
                "hosts",
                "Number of hosts in the pool",
                &["xenhost", "pool"],
            ),
            master: GaugeDesc::new(
                &ctx.namespace,
                SUBSYSTEM,
                "master_info",
                "Pool master, always 1",
                &["xenhost", "pool", "master"],
            ),
        }
    }
}

#[async_trait]
impl Collector for PoolCollector {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn collect(&self, sink: &MetricSink) -> Result<(), CollectError> {
        for host in self.hosts.iter() {
            let pools = with_session(&self.sessions, host, |client| async move {
                query_pools(&client).await
            })
            .await?;

            for pool in &pools {
                let labels = [host.host(), pool.name.as_str()];
                let ha = if pool.ha_enabled { 1.0 } else { 0.0 };
                sink.emit(self.ha_enabled.sample(ha, &labels));
                sink.emit(self.members.sample(pool.hosts as f64, &labels));
                sink.emit(
                    self.master
                        .sample(1.0, &[host.host(), pool.name.as_str(), pool.master.as_str()]),
                );
            }
        }
        Ok(())
    }
}
