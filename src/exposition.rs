// Exposition module - Prometheus text format for gauge samples

use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;

use crate::metrics::GaugeSample;

/// Groups samples into metric families, keeping first-seen order
pub fn to_families(samples: Vec<GaugeSample>) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for sample in samples {
        let idx = *index.entry(sample.name.clone()).or_insert_with(|| {
            let mut family = MetricFamily::new();
            family.set_name(sample.name.clone());
            family.set_help(sample.help.clone());
            family.set_field_type(MetricType::GAUGE);
            families.push(family);
            families.len() - 1
        });

        let mut gauge = Gauge::new();
        gauge.set_value(sample.value);

        let mut metric = Metric::new();
        metric.set_gauge(gauge);
        for (name, value) in sample.labels {
            let mut pair = LabelPair::new();
            pair.set_name(name);
            pair.set_value(value);
            metric.mut_label().push(pair);
        }

        families[idx].mut_metric().push(metric);
    }

    families
}

/// Renders samples in the text format served on the metrics path
pub fn encode(samples: Vec<GaugeSample>) -> prometheus::Result<String> {
    let families = to_families(samples);
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
