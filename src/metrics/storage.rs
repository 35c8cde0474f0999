// Storage repository collector
//
// Reports size and utilisation of every SR visible from each configured
// host. Shared SRs of a pool show up once per configured host, which is
// why samples carry the `xenhost` label.

use async_trait::async_trait;
use std::sync::Arc;

use super::{with_session, CollectError, Collector, CollectorContext, GaugeDesc, MetricSink};
use crate::config::HostConfig;
use crate::session::SessionCache;
use crate::xenapi::{XenApiError, XenClient};

const SUBSYSTEM: &str = "sr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrMetrics {
    pub name: String,
    pub physical_size: i64,
    pub physical_utilisation: i64,
}

pub async fn query_storage(client: &XenClient) -> Result<Vec<SrMetrics>, XenApiError> {
    let srs = client.get_all("SR.get_all").await?;
    let mut results = Vec::with_capacity(srs.len());

    for sr_ref in &srs {
        results.push(SrMetrics {
            name: client.get_string("SR.get_name_label", sr_ref).await?,
            physical_size: client.get_int("SR.get_physical_size", sr_ref).await?,
            physical_utilisation: client
                .get_int("SR.get_physical_utilisation", sr_ref)
                .await?,
        });
    }

    Ok(results)
}

pub struct StorageCollector {
    hosts: Arc<Vec<HostConfig>>,
    sessions: Arc<SessionCache>,
    size: GaugeDesc,
    utilisation: GaugeDesc,
    free: GaugeDesc,
}

impl StorageCollector {
    pub const NAME: &'static str = "storage";

    pub fn new(ctx: &CollectorContext) -> Self {
        let desc = |name, help| {
            GaugeDesc::new(&ctx.namespace, SUBSYSTEM, name, help, &["xenhost", "sr"])
        };

        StorageCollector {
            hosts: ctx.hosts.clone(),
            sessions: ctx.sessions.clone(),
            size: desc("physical_size_bytes", "Physical size of the storage repository"),
            utilisation: desc(
                "physical_utilisation_bytes",
                "Physical space used on the storage repository",
            ),
            free: desc("free_bytes", "Physical space left on the storage repository"),
        }
    }
}

#[async_trait]
impl Collector for StorageCollector {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn collect(&self, sink: &MetricSink) -> Result<(), CollectError> {
        for host in self.hosts.iter() {
            let srs = with_session(&self.sessions, host, |client| async move {
                query_storage(&client).await
            })
            .await?;

            for sr in &srs {
                let labels = [host.host(), sr.name.as_str()];
                sink.emit(self.size.sample(sr.physical_size as f64, &labels));
                sink.emit(self.utilisation.sample(sr.physical_utilisation as f64, &labels));
                sink.emit(
                    self.free
                        .sample((sr.physical_size - sr.physical_utilisation) as f64, &labels),
                );
            }
        }
        Ok(())
    }
}
