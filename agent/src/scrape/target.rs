use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use url::Url;

use common::error::{Error, Result};
use common::labels::Labels;

use crate::appender::{Appender, Sample};
use crate::scrape::exposition;
use crate::scrape::relabel;
use crate::scrape::scrape::Arguments;

pub const EXPORTED_LABEL_PREFIX: &str = "exported_";
pub const METRIC_NAME_LABEL: &str = "__name__";
pub const SCHEME_LABEL: &str = "__scheme__";
pub const ADDRESS_LABEL: &str = "__address__";
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const RESERVED_LABEL_PREFIX: &str = "__";
pub const META_LABEL_PREFIX: &str = "__meta_";
pub const PARAM_LABEL_PREFIX: &str = "__param_";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";
pub const BUCKET_LABEL: &str = "le";
pub const QUANTILE_LABEL: &str = "quantile";

/// Metric name under which a scrape reports its own health (1/0).
pub const SCRAPE_HEALTH_METRIC_NAME: &str = "up";
/// Metric name under which a scrape reports its own duration in seconds.
pub const SCRAPE_DURATION_METRIC_NAME: &str = "scrape_duration_seconds";

/// Capacity of the per-scrape channel between the parse loop and the
/// appender drain task. A payload outpacing the drain by more than this
/// aborts the scrape instead of blocking it.
pub const INGESTED_SAMPLES_CAP: usize = 4096;

const ACCEPT_HEADER: &str = "text/plain;version=0.0.4;q=1,*/*;q=0.1";

// TargetHealth describes the health state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

impl TargetHealth {
    /// Sample value for the health metric: 1 healthy, 0 otherwise.
    pub fn sample_value(self) -> f64 {
        if self == TargetHealth::Healthy {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    health: TargetHealth,
    last_error: Option<Arc<Error>>,
    last_scrape: Option<DateTime<Utc>>,
}

/// Health record of one target. The run-loop writes it once per scrape
/// attempt; reporting code reads it concurrently. All fields live behind a
/// single mutex.
#[derive(Debug)]
pub struct TargetStatus {
    inner: Mutex<StatusInner>,
}

impl TargetStatus {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                health: TargetHealth::Unknown,
                last_error: None,
                last_scrape: None,
            }),
        }
    }

    pub fn health(&self) -> TargetHealth {
        self.inner.lock().unwrap().health
    }

    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.inner.lock().unwrap().last_error.clone()
    }

    pub fn last_scrape(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().last_scrape
    }

    /// Records the outcome of a scrape attempt; health follows the error.
    fn set_last_error(&self, err: Option<Arc<Error>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.health = match err {
            None => TargetHealth::Healthy,
            Some(_) => TargetHealth::Unhealthy,
        };
        inner.last_error = err;
    }

    /// The last-scrape timestamp only moves forward.
    fn set_last_scrape(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.last_scrape.map_or(true, |prev| at > prev) {
            inner.last_scrape = Some(at);
        }
    }
}

// Target refers to a singular HTTP or HTTPS endpoint.
#[derive(Debug)]
pub struct Target {
    all_labels: Labels,
    base_labels: Labels,
    discovered_labels: Labels,
    url: Url,
    scrape_interval: Duration,
    deadline: Duration,
    honor_labels: bool,
    metric_relabel_configs: Vec<relabel::Config>,
    http_client: reqwest::Client,
    status: TargetStatus,
    scraper_stopping: watch::Sender<bool>,
    scraper_stopped: watch::Sender<bool>,
}

impl Target {
    /// Builds a target from its resolved configuration, a populated label set
    /// (reserved labels included, see [`populate_labels`]) and the job's
    /// shared HTTP client.
    pub fn new(
        cfg: &Arguments,
        http_client: reqwest::Client,
        labels: Labels,
        discovered_labels: Labels,
    ) -> Result<Self> {
        let url = url_from_target(&labels, &cfg.params)?;

        let mut base_labels = Labels::new();
        for (name, value) in labels.iter() {
            if !name.starts_with(RESERVED_LABEL_PREFIX) {
                base_labels.set(name, value);
            }
        }
        if base_labels.get(INSTANCE_LABEL).is_none() {
            base_labels.set(INSTANCE_LABEL, instance_identifier(&url));
        }

        Ok(Target {
            all_labels: labels,
            base_labels,
            discovered_labels,
            url,
            scrape_interval: cfg.scrape_interval,
            deadline: cfg.scrape_timeout,
            honor_labels: cfg.honor_labels,
            metric_relabel_configs: cfg.metric_relabel_configs.clone(),
            http_client,
            status: TargetStatus::new(),
            scraper_stopping: watch::channel(false).0,
            scraper_stopped: watch::channel(false).0,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scrape_interval(&self) -> Duration {
        self.scrape_interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Identity labels attached to every sample of this target.
    pub fn base_labels(&self) -> &Labels {
        &self.base_labels
    }

    /// Label set as it came out of discovery, before population.
    pub fn discovered_labels(&self) -> &Labels {
        &self.discovered_labels
    }

    pub fn status(&self) -> &TargetStatus {
        &self.status
    }

    /// Identity of the target within a scrape pool.
    pub fn hash(&self) -> u64 {
        self.all_labels.hash()
    }

    /// Performs one scrape cycle: fetch, merge/relabel, ingest, then record
    /// the outcome in the target status and as self-health samples.
    pub async fn scrape(&self, appender: &Arc<dyn Appender>) -> Result<(), Arc<Error>> {
        let start = Utc::now();
        let timer = Instant::now();
        self.status.set_last_scrape(start);

        let result = self.scrape_once(appender).await.map_err(Arc::new);
        self.status.set_last_error(result.as_ref().err().map(Arc::clone));
        record_scrape_health(
            appender.as_ref(),
            start,
            &self.base_labels,
            self.status.health(),
            timer.elapsed(),
        )
        .await;
        result
    }

    async fn scrape_once(&self, appender: &Arc<dyn Appender>) -> Result<()> {
        let response = self
            .http_client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::BadResponseStatus(format!(
                "{} {}",
                status.as_str(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let body = response.text().await?;
        let samples = exposition::decode(&body, Utc::now())?;

        let (tx, mut rx) = mpsc::channel::<Sample>(INGESTED_SAMPLES_CAP);
        let sink = Arc::clone(appender);
        let drain = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                sink.append(sample).await?;
            }
            Ok::<(), Error>(())
        });

        for Sample {
            labels,
            value,
            timestamp,
        } in samples
        {
            let labels = merge_labels(&self.base_labels, labels, self.honor_labels);
            let Some(labels) = relabel::process(labels, &self.metric_relabel_configs) else {
                continue;
            };
            match tx.try_send(Sample {
                labels,
                value,
                timestamp,
            }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Fail fast: the sink is not keeping up. Samples already
                    // enqueued keep draining in the background; the rest of
                    // the payload is abandoned.
                    drop(tx);
                    return Err(Error::IngestChannelFull);
                }
                // The drain task died on an appender error; pick it up below.
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        drop(tx);

        match drain.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(Error::Internal(format!("ingest drain task failed: {err}"))),
        }
    }

    /// Runs the scrape loop: an immediate scrape, then one per interval until
    /// [`Target::stop_scraper`] is observed. Scrape failures are recorded in
    /// the target status and never end the loop; retry is the next tick.
    pub async fn run_scraper(&self, appender: Arc<dyn Appender>) {
        let mut stopping = self.scraper_stopping.subscribe();
        let mut ticker = tokio::time::interval(self.scrape_interval);
        // A stuck scrape delays subsequent ticks instead of bursting.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *stopping.borrow() {
                break;
            }
            if let Err(err) = self.scrape(&appender).await {
                log::debug!("scrape of {} failed: {err}", self.url);
            }
            tokio::select! {
                _ = stopping.changed() => break,
                _ = ticker.tick() => {}
            }
        }

        self.scraper_stopped.send_replace(true);
    }

    /// Signals the run-loop to stop and waits for its acknowledgement. Once
    /// this returns, no further scrape of this target occurs; the loop is
    /// not restartable.
    pub async fn stop_scraper(&self) {
        self.scraper_stopping.send_replace(true);
        let mut stopped = self.scraper_stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

/// Combines a target's base labels into a scraped sample's label set.
///
/// With `honor_labels` unset, base labels win: a colliding non-empty scraped
/// value is kept under an `exported_`-prefixed name. With it set, scraped
/// labels win, except that an empty scraped value never overrides a base
/// label. Empty values do not survive the merge.
pub fn merge_labels(base: &Labels, mut scraped: Labels, honor_labels: bool) -> Labels {
    for (name, base_value) in base.iter() {
        match scraped.get(name).map(str::to_string) {
            Some(scraped_value) if !scraped_value.is_empty() => {
                if !honor_labels {
                    scraped.set(format!("{EXPORTED_LABEL_PREFIX}{name}"), scraped_value);
                    scraped.set(name, base_value);
                }
            }
            _ => scraped.set(name, base_value),
        }
    }

    let empty: Vec<String> = scraped
        .iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name.to_string())
        .collect();
    for name in empty {
        scraped.del(&name);
    }
    scraped
}

/// Appends the two self-observation samples for one scrape: health first,
/// then duration. They carry exactly the target's base labels; the relabel
/// pipeline does not apply to them.
pub async fn record_scrape_health(
    appender: &dyn Appender,
    at: DateTime<Utc>,
    base_labels: &Labels,
    health: TargetHealth,
    duration: Duration,
) {
    let sample = |metric_name: &str, value: f64| {
        let mut labels = base_labels.clone();
        labels.set(METRIC_NAME_LABEL, metric_name);
        Sample {
            labels,
            value,
            timestamp: at,
        }
    };

    let health_sample = sample(SCRAPE_HEALTH_METRIC_NAME, health.sample_value());
    let duration_sample = sample(SCRAPE_DURATION_METRIC_NAME, duration.as_secs_f64());

    for sample in [health_sample, duration_sample] {
        if let Err(err) = appender.append(sample).await {
            log::debug!("failed to append scrape health sample: {err}");
        }
    }
}

/// Prepares a discovered label set for scraping: configuration defaults are
/// filled in, query parameters are encoded as `__param_*` labels, addresses
/// get their scheme's default port, `__meta_*` labels are removed and the
/// instance label is derived from the address.
///
/// Returns the populated set together with the untouched discovered set, or
/// `None` when the target carries no address and must be dropped.
pub fn populate_labels(mut lset: Labels, cfg: &Arguments) -> Result<Option<(Labels, Labels)>> {
    let discovered = lset.clone();

    if lset.get(JOB_LABEL).is_none() {
        lset.set(JOB_LABEL, cfg.job_name.as_str());
    }
    if lset.get(SCHEME_LABEL).is_none() {
        lset.set(SCHEME_LABEL, cfg.scheme.as_str());
    }
    if lset.get(METRICS_PATH_LABEL).is_none() {
        lset.set(METRICS_PATH_LABEL, cfg.metrics_path.as_str());
    }
    for (key, values) in &cfg.params {
        if let Some(value) = values.first() {
            let name = format!("{PARAM_LABEL_PREFIX}{key}");
            if lset.get(&name).is_none() {
                lset.set(name, value.as_str());
            }
        }
    }

    let mut address = match lset.get(ADDRESS_LABEL) {
        Some(address) => address.to_string(),
        None => return Ok(None),
    };
    if !address.contains(':') {
        let port = match lset.get(SCHEME_LABEL).unwrap_or("http") {
            "http" => "80",
            "https" => "443",
            scheme => return Err(Error::Config(format!("invalid scheme: {scheme}"))),
        };
        address = format!("{address}:{port}");
        lset.set(ADDRESS_LABEL, address.as_str());
    }

    let meta: Vec<String> = lset
        .iter()
        .filter(|(name, _)| name.starts_with(META_LABEL_PREFIX))
        .map(|(name, _)| name.to_string())
        .collect();
    for name in meta {
        lset.del(&name);
    }

    if lset.get(INSTANCE_LABEL).is_none() {
        lset.set(INSTANCE_LABEL, address);
    }

    Ok(Some((lset, discovered)))
}

fn url_from_target(labels: &Labels, params: &HashMap<String, Vec<String>>) -> Result<Url> {
    let mut query: BTreeMap<String, Vec<String>> = params
        .iter()
        .map(|(key, values)| (key.clone(), values.clone()))
        .collect();

    // __param_* labels override the first value of the matching parameter.
    for (name, value) in labels.iter() {
        let Some(key) = name.strip_prefix(PARAM_LABEL_PREFIX) else {
            continue;
        };
        let values = query.entry(key.to_string()).or_default();
        if values.is_empty() {
            values.push(value.to_string());
        } else {
            values[0] = value.to_string();
        }
    }

    let scheme = labels.get(SCHEME_LABEL).unwrap_or("http");
    let address = labels
        .get(ADDRESS_LABEL)
        .ok_or_else(|| Error::Config("target has no address".into()))?;
    let path = labels.get(METRICS_PATH_LABEL).unwrap_or("/metrics");

    let mut url = Url::parse(&format!("{scheme}://{address}{path}"))
        .map_err(|e| Error::Config(format!("invalid target URL: {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, values) in &query {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
    }
    Ok(url)
}

fn instance_identifier(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
