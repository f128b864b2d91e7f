//! Metric samples and Prometheus text exposition
//!
//! Sub-collectors return flat sample lists; this module sanitizes names,
//! guards against duplicate fingerprints within one scrape and serializes
//! everything into the Prometheus text exposition format (v0.0.4).

use crate::{CollectorError, Result};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use tracing::warn;

// OpenMetrics and the Prometheus exposition format restrict metric names
// to alphanumerics and underscores. Colons are reserved for derived or
// aggregated series produced by recording rules and are replaced here as
// well.
static METRIC_NAME_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_*[^0-9A-Za-z_]+_*").expect("static regex"));

/// Replace every run of invalid characters in a metric name by a single
/// underscore. Idempotent: sanitizing twice changes nothing.
pub fn sanitize_metric_name(name: &str) -> String {
    METRIC_NAME_INVALID.replace_all(name, "_").into_owned()
}

/// How a sample is typed in the exposition output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Monotonically increasing value
    Counter,
    /// Point-in-time value
    Gauge,
}

/// One metric sample produced by a sub-collector.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Fully qualified metric name, sanitized at construction
    pub name: String,

    /// HELP text
    pub help: String,

    /// Exposition type
    pub kind: SampleKind,

    /// Label pairs; order is irrelevant, the fingerprint sorts them
    pub labels: Vec<(String, String)>,

    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Create a counter sample.
    pub fn counter(name: impl Into<String>, help: impl Into<String>, value: f64) -> Self {
        Self {
            name: sanitize_metric_name(&name.into()),
            help: help.into(),
            kind: SampleKind::Counter,
            labels: Vec::new(),
            value,
        }
    }

    /// Create a gauge sample.
    pub fn gauge(name: impl Into<String>, help: impl Into<String>, value: f64) -> Self {
        Self {
            name: sanitize_metric_name(&name.into()),
            help: help.into(),
            kind: SampleKind::Gauge,
            labels: Vec::new(),
            value,
        }
    }

    /// Attach a label pair.
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((name.into(), value.into()));
        self
    }

    /// The sample's identity within one scrape: name plus sorted label
    /// set. Two samples with the same fingerprint in one scrape are a
    /// bug in a sub-collector.
    pub fn fingerprint(&self) -> String {
        let mut sorted: Vec<&(String, String)> = self.labels.iter().collect();
        sorted.sort();

        let mut fp = self.name.clone();
        for (k, v) in sorted {
            fp.push('\u{1}');
            fp.push_str(k);
            fp.push('\u{2}');
            fp.push_str(v);
        }
        fp
    }
}

/// Serialize samples into the Prometheus text format.
///
/// Samples sharing a name form one metric family; a duplicate
/// fingerprint is dropped with a warning rather than silently summed.
pub fn encode(samples: &[Sample]) -> Result<String> {
    let registry = Registry::new();
    let mut seen = HashSet::new();

    // Group into families; BTreeMap gives deterministic family order
    let mut families: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in samples {
        if !seen.insert(sample.fingerprint()) {
            warn!(metric = %sample.name, "Duplicate metric fingerprint within one scrape, dropping");
            continue;
        }
        families.entry(&sample.name).or_default().push(sample);
    }

    for (name, members) in families {
        let first = members[0];

        let mut label_names: Vec<&str> = first.labels.iter().map(|(k, _)| k.as_str()).collect();
        label_names.sort_unstable();

        let opts = Opts::new(name, first.help.clone());

        match first.kind {
            SampleKind::Counter => {
                let vec = CounterVec::new(opts, &label_names)
                    .map_err(|e| CollectorError::Exposition(e.to_string()))?;
                registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| CollectorError::Exposition(e.to_string()))?;

                for sample in members {
                    let values = ordered_label_values(sample, &label_names);
                    let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                    vec.with_label_values(&refs).inc_by(sample.value);
                }
            }
            SampleKind::Gauge => {
                let vec = GaugeVec::new(opts, &label_names)
                    .map_err(|e| CollectorError::Exposition(e.to_string()))?;
                registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| CollectorError::Exposition(e.to_string()))?;

                for sample in members {
                    let values = ordered_label_values(sample, &label_names);
                    let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                    vec.with_label_values(&refs).set(sample.value);
                }
            }
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| CollectorError::Exposition(e.to_string()))?;

    String::from_utf8(buffer).map_err(|e| CollectorError::Exposition(e.to_string()))
}

fn ordered_label_values(sample: &Sample, label_names: &[&str]) -> Vec<String> {
    label_names
        .iter()
        .map(|name| {
            sample
                .labels
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_collapses_runs() {
        assert_eq!(sanitize_metric_name("ceems_perf_cpucycles_total"), "ceems_perf_cpucycles_total");
        assert_eq!(sanitize_metric_name("a b--c"), "a_b_c");
        assert_eq!(sanitize_metric_name("job:cpu:rate"), "job_cpu_rate");
        assert_eq!(sanitize_metric_name("_a__b_"), "_a__b_");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for name in ["a b--c", "job:cpu:rate", "x//y..z", "already_clean_total"] {
            let once = sanitize_metric_name(name);
            assert_eq!(sanitize_metric_name(&once), once, "sanitize({}) not idempotent", name);
        }
    }

    #[test]
    fn test_fingerprint_ignores_label_order() {
        let a = Sample::counter("m_total", "help", 1.0)
            .with_label("uuid", "1")
            .with_label("hostname", "n1");
        let b = Sample::counter("m_total", "help", 2.0)
            .with_label("hostname", "n1")
            .with_label("uuid", "1");

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_values() {
        let a = Sample::counter("m_total", "help", 1.0).with_label("uuid", "1");
        let b = Sample::counter("m_total", "help", 1.0).with_label("uuid", "2");

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_encode_text_format() {
        let samples = vec![
            Sample::counter("ceems_perf_cpucycles_total", "Number of CPU cycles", 12345.0)
                .with_label("manager", "slurm")
                .with_label("hostname", "n1")
                .with_label("uuid", "1481508"),
            Sample::gauge("ceems_scrape_collector_success", "Scrape success", 1.0)
                .with_label("collector", "perf"),
        ];

        let out = encode(&samples).unwrap();

        assert!(out.contains("# TYPE ceems_perf_cpucycles_total counter"));
        assert!(out.contains("# HELP ceems_perf_cpucycles_total Number of CPU cycles"));
        assert!(out.contains(r#"uuid="1481508""#));
        assert!(out.contains("12345"));
        assert!(out.contains("# TYPE ceems_scrape_collector_success gauge"));
    }

    #[test]
    fn test_encode_drops_duplicate_fingerprints() {
        let samples = vec![
            Sample::counter("dup_total", "help", 1.0).with_label("uuid", "1"),
            Sample::counter("dup_total", "help", 5.0).with_label("uuid", "1"),
        ];

        let out = encode(&samples).unwrap();

        // The first sample wins; the duplicate is not summed in
        assert!(out.contains("dup_total{uuid=\"1\"} 1"));
        assert!(!out.contains("dup_total{uuid=\"1\"} 6"));
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&[]).unwrap(), "");
    }
}
