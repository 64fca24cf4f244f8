use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::{Histogram, HistogramOpts};

use common::error::{Error, Result};
use common::labels::Labels;

use crate::scrape::target::METRIC_NAME_LABEL;

/// A single metric value on its way to storage. The metric name travels
/// inside the label set under `__name__`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Labels,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn name(&self) -> &str {
        self.labels.get(METRIC_NAME_LABEL).unwrap_or("")
    }
}

/// Capability accepting one sample at a time for storage.
#[async_trait]
pub trait Appender: Send + Sync {
    async fn append(&self, sample: Sample) -> Result<()>;
}

/// Forwards every sample to a set of child appenders, in order.
pub struct Fanout {
    children: Vec<Arc<dyn Appender>>,
    write_latency: Histogram,
}

impl Fanout {
    pub fn new(children: Vec<Arc<dyn Appender>>) -> Result<Self> {
        let write_latency = Histogram::with_opts(HistogramOpts::new(
            "agent_fanout_append_latency_seconds",
            "Append latency across fanout children.",
        ))
        .map_err(|e| Error::Internal(format!("creating fanout metrics: {e}")))?;
        // Registration conflicts only occur when several fanouts share the
        // process; the histogram still observes either way.
        let _ = prometheus::default_registry().register(Box::new(write_latency.clone()));
        Ok(Self {
            children,
            write_latency,
        })
    }
}

#[async_trait]
impl Appender for Fanout {
    async fn append(&self, sample: Sample) -> Result<()> {
        let start = Instant::now();
        for child in &self.children {
            child.append(sample.clone()).await?;
        }
        self.write_latency.observe(start.elapsed().as_secs_f64());
        Ok(())
    }
}

/// Sink that logs every sample at debug level.
pub struct LogAppender;

#[async_trait]
impl Appender for LogAppender {
    async fn append(&self, sample: Sample) -> Result<()> {
        log::debug!("{} {} = {}", sample.timestamp, sample.labels, sample.value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::testutil::CollectAppender;

    #[tokio::test]
    async fn fanout_forwards_to_every_child() {
        let first = Arc::new(CollectAppender::default());
        let second = Arc::new(CollectAppender::default());
        let children: Vec<Arc<dyn Appender>> = vec![first.clone(), second.clone()];
        let fanout = Fanout::new(children).unwrap();

        let mut labels = Labels::new();
        labels.set(METRIC_NAME_LABEL, "test_metric");
        let sample = Sample {
            labels,
            value: 1.0,
            timestamp: Utc::now(),
        };
        fanout.append(sample.clone()).await.unwrap();

        assert_eq!(first.collected(), vec![sample.clone()]);
        assert_eq!(second.collected(), vec![sample]);
    }
}
