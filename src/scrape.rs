// Scrape module - runs all enabled collectors for one scrape
//
// Each scrape spawns one Tokio task per collector. Tasks run concurrently
// and independently; a collector that fails (or panics) is reported through
// its success gauge and never takes the rest of the scrape down with it.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::metrics::{Collector, GaugeDesc, GaugeSample, MetricSink};

/// Result of one collector run
struct Outcome {
    duration: Duration,
    success: bool,
}

/// Fans a scrape out over the enabled collectors
///
/// The collector map is built once at startup and shared read-only by every
/// scrape, so no locking is needed here.
pub struct Scraper {
    collectors: Arc<BTreeMap<String, Arc<dyn Collector>>>,
    duration_desc: GaugeDesc,
    success_desc: GaugeDesc,
}

impl Scraper {
    /// Creates a new Scraper instance
    ///
    /// # Arguments
    /// * `namespace` - Prefix of the meta-metric names
    /// * `collectors` - Enabled collectors by name
    pub fn new(namespace: &str, collectors: BTreeMap<String, Arc<dyn Collector>>) -> Self {
        Scraper {
            collectors: Arc::new(collectors),
            duration_desc: GaugeDesc::new(
                namespace,
                "exporter",
                "collector_duration_seconds",
                "xenstats: Duration of a collection.",
                &["collector"],
            ),
            success_desc: GaugeDesc::new(
                namespace,
                "exporter",
                "collector_success",
                "xenstats: Whether the collector was successful.",
                &["collector"],
            ),
        }
    }

    pub fn collector_names(&self) -> Vec<&str> {
        self.collectors.keys().map(String::as_str).collect()
    }

    /// Runs every collector once and returns all samples
    ///
    /// Returns only after every collector task has finished. The result
    /// holds the collectors' own samples followed by a duration and a
    /// success gauge per collector.
    pub async fn scrape(&self) -> Vec<GaugeSample> {
        let (sink, mut rx) = MetricSink::channel();

        let handles: Vec<_> = self
            .collectors
            .values()
            .map(|collector| {
                let collector = Arc::clone(collector);
                let sink = sink.clone();
                tokio::spawn(async move { execute(collector.as_ref(), &sink).await })
            })
            .collect();

        // Only the tasks hold senders from here on.
        drop(sink);

        let started = Instant::now();
        let results = join_all(handles).await;

        let mut samples = Vec::new();
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }

        for (collector, result) in self.collectors.values().zip(results) {
            let name = collector.name();
            let outcome = result.unwrap_or_else(|e| {
                error!("ERROR: {} collector task aborted: {}", name, e);
                Outcome {
                    duration: started.elapsed(),
                    success: false,
                }
            });

            samples.push(
                self.duration_desc
                    .sample(outcome.duration.as_secs_f64(), &[name]),
            );
            samples.push(
                self.success_desc
                    .sample(if outcome.success { 1.0 } else { 0.0 }, &[name]),
            );
        }

        samples
    }
}

async fn execute(collector: &dyn Collector, sink: &MetricSink) -> Outcome {
    let name = collector.name();
    let begin = Instant::now();
    let result = collector.collect(sink).await;
    let duration = begin.elapsed();

    match result {
        Ok(()) => {
            debug!(
                "OK: {} collector succeeded after {:.6}s.",
                name,
                duration.as_secs_f64()
            );
            Outcome {
                duration,
                success: true,
            }
        }
        Err(e) => {
            error!(
                "ERROR: {} collector failed after {:.6}s: {}",
                name,
                duration.as_secs_f64(),
                e
            );
            Outcome {
                duration,
                success: false,
            }
        }
    }
}
