use chrono::{DateTime, Utc};

use common::error::{Error, Result};
use common::labels::Labels;

use crate::appender::Sample;
use crate::scrape::target::{BUCKET_LABEL, METRIC_NAME_LABEL, QUANTILE_LABEL};

/// Decodes a text exposition payload into flat samples, preserving input
/// order.
///
/// The format parser is an external collaborator; histograms and summaries
/// come back from it pre-grouped and are flattened into per-bucket and
/// per-quantile series here.
pub fn decode(body: &str, at: DateTime<Utc>) -> Result<Vec<Sample>> {
    let lines = body.lines().map(|line| Ok(line.to_string()));
    let scrape = prometheus_parse::Scrape::parse_at(lines, at)
        .map_err(|e| Error::Decode(e.to_string()))?;

    let mut samples = Vec::with_capacity(scrape.samples.len());
    for parsed in scrape.samples {
        let mut labels = Labels::new();
        for (name, value) in parsed.labels.iter() {
            labels.set(name.as_str(), value.as_str());
        }

        match parsed.value {
            prometheus_parse::Value::Counter(value)
            | prometheus_parse::Value::Gauge(value)
            | prometheus_parse::Value::Untyped(value) => {
                labels.set(METRIC_NAME_LABEL, parsed.metric.as_str());
                samples.push(Sample {
                    labels,
                    value,
                    timestamp: parsed.timestamp,
                });
            }
            prometheus_parse::Value::Histogram(buckets) => {
                for bucket in buckets {
                    let mut labels = labels.clone();
                    labels.set(METRIC_NAME_LABEL, format!("{}_bucket", parsed.metric));
                    labels.set(BUCKET_LABEL, format_bound(bucket.less_than));
                    samples.push(Sample {
                        labels,
                        value: bucket.count,
                        timestamp: parsed.timestamp,
                    });
                }
            }
            prometheus_parse::Value::Summary(quantiles) => {
                for quantile in quantiles {
                    let mut labels = labels.clone();
                    labels.set(METRIC_NAME_LABEL, parsed.metric.as_str());
                    labels.set(QUANTILE_LABEL, format_bound(quantile.quantile));
                    samples.push(Sample {
                        labels,
                        value: quantile.count,
                        timestamp: parsed.timestamp,
                    });
                }
            }
        }
    }
    Ok(samples)
}

fn format_bound(bound: f64) -> String {
    if bound == f64::INFINITY {
        "+Inf".to_string()
    } else {
        bound.to_string()
    }
}
