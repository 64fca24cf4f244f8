use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use common::error::Result;
use common::labels::Labels;

use crate::appender::Appender;
use crate::scrape::client::new_http_client;
use crate::scrape::scrape::Arguments;
use crate::scrape::target::{populate_labels, Target};
use crate::scrape::Group;

/// A running target: the target itself plus its run-loop task.
struct ActiveTarget {
    target: Arc<Target>,
    handle: JoinHandle<()>,
}

/// Pool of running scrape loops for one job.
pub struct ScrapePool {
    config: Arguments,
    appender: Arc<dyn Appender>,
    client: reqwest::Client,
    active_targets: HashMap<u64, ActiveTarget>,
    dropped_targets: Vec<Labels>,
}

impl ScrapePool {
    /// Creates the pool and builds the job's HTTP client once. Broken auth
    /// configuration surfaces here, before any scrape is attempted.
    pub fn new(config: Arguments, appender: Arc<dyn Appender>) -> Result<Self> {
        let client = new_http_client(&config)?;
        Ok(Self {
            config,
            appender,
            client,
            active_targets: HashMap::new(),
            dropped_targets: Vec::new(),
        })
    }

    /// Reconciles the running loops against the latest discovery groups:
    /// new targets get a run-loop, vanished targets are stopped and removed.
    pub async fn sync(&mut self, groups: &[Group]) {
        debug!("syncing target groups; job={:?}", self.config.job_name);

        let mut targets = Vec::new();
        self.dropped_targets.clear();
        for group in groups {
            let (resolved, dropped) = targets_from_group(group, &self.config, &self.client);
            targets.extend(resolved);
            self.dropped_targets.extend(dropped);
        }

        let mut keep = HashSet::new();
        for target in targets {
            let hash = target.hash();
            if !keep.insert(hash) || self.active_targets.contains_key(&hash) {
                continue;
            }
            let target = Arc::new(target);
            let scraper = Arc::clone(&target);
            let appender = Arc::clone(&self.appender);
            let handle = tokio::spawn(async move {
                scraper.run_scraper(appender).await;
            });
            self.active_targets.insert(hash, ActiveTarget { target, handle });
        }

        let stale: Vec<u64> = self
            .active_targets
            .keys()
            .filter(|hash| !keep.contains(hash))
            .copied()
            .collect();
        for hash in stale {
            if let Some(active) = self.active_targets.remove(&hash) {
                active.target.stop_scraper().await;
                let _ = active.handle.await;
            }
        }

        info!(
            "job {:?}: {} active targets, {} dropped",
            self.config.job_name,
            self.active_targets.len(),
            self.dropped_targets.len()
        );
    }

    /// Stops every run-loop and waits for all of them to wind down.
    pub async fn stop(&mut self) {
        let active: Vec<ActiveTarget> = self.active_targets.drain().map(|(_, a)| a).collect();
        future::join_all(active.iter().map(|a| a.target.stop_scraper())).await;
        future::join_all(active.into_iter().map(|a| a.handle)).await;
    }

    pub fn active_targets(&self) -> Vec<Arc<Target>> {
        self.active_targets
            .values()
            .map(|a| Arc::clone(&a.target))
            .collect()
    }

    /// Targets discarded during the last sync, kept for inspection.
    pub fn dropped_targets(&self) -> &[Labels] {
        &self.dropped_targets
    }
}

fn targets_from_group(
    group: &Group,
    cfg: &Arguments,
    client: &reqwest::Client,
) -> (Vec<Target>, Vec<Labels>) {
    let mut targets = Vec::with_capacity(group.targets.len());
    let mut dropped = Vec::new();

    for tlset in &group.targets {
        let mut lbls = Labels::from_map(tlset.clone());
        for (name, value) in &group.labels {
            if !tlset.contains_key(name) {
                lbls.set(name.as_str(), value.as_str());
            }
        }

        match populate_labels(lbls.clone(), cfg) {
            Ok(Some((populated, discovered))) => {
                match Target::new(cfg, client.clone(), populated, discovered) {
                    Ok(target) => targets.push(target),
                    Err(err) => {
                        warn!("dropping target from group {:?}: {err}", group.source);
                        dropped.push(lbls);
                    }
                }
            }
            Ok(None) => dropped.push(lbls),
            Err(err) => {
                warn!("dropping target from group {:?}: {err}", group.source);
                dropped.push(lbls);
            }
        }
    }

    (targets, dropped)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scrape::testutil::{NopAppender, TestServer};
    use crate::scrape::target::TargetHealth;
    use crate::scrape::LabelSet;

    fn group(targets: Vec<LabelSet>) -> Group {
        Group {
            targets,
            labels: LabelSet::new(),
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn sync_starts_and_stops_run_loops() {
        let server = TestServer::serve("some_metric 1\n").await;
        let cfg = Arguments {
            job_name: "pool_job".to_string(),
            scrape_interval: Duration::from_millis(10),
            scrape_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let mut pool = ScrapePool::new(cfg, Arc::new(NopAppender)).unwrap();

        let tlset = LabelSet::from([("__address__".to_string(), server.addr.to_string())]);
        pool.sync(&[group(vec![tlset.clone()])]).await;
        assert_eq!(pool.active_targets().len(), 1);

        // Re-syncing the same group keeps the existing loop.
        pool.sync(&[group(vec![tlset])]).await;
        assert_eq!(pool.active_targets().len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let target = &pool.active_targets()[0];
        assert_eq!(target.status().health(), TargetHealth::Healthy);
        assert!(target.status().last_scrape().is_some());

        pool.sync(&[]).await;
        assert!(pool.active_targets().is_empty());
    }

    #[tokio::test]
    async fn sync_tracks_dropped_targets() {
        let cfg = Arguments {
            job_name: "pool_job".to_string(),
            ..Default::default()
        };
        let mut pool = ScrapePool::new(cfg, Arc::new(NopAppender)).unwrap();

        // No __address__ label: the target cannot be scraped.
        let tlset = LabelSet::from([("job".to_string(), "somewhere".to_string())]);
        pool.sync(&[group(vec![tlset])]).await;

        assert!(pool.active_targets().is_empty());
        assert_eq!(pool.dropped_targets().len(), 1);
    }

    #[tokio::test]
    async fn stop_ends_all_loops() {
        let server = TestServer::serve("some_metric 1\n").await;
        let cfg = Arguments {
            job_name: "pool_job".to_string(),
            scrape_interval: Duration::from_millis(10),
            scrape_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let mut pool = ScrapePool::new(cfg, Arc::new(NopAppender)).unwrap();

        let tlset = LabelSet::from([("__address__".to_string(), server.addr.to_string())]);
        pool.sync(&[group(vec![tlset])]).await;
        let targets = pool.active_targets();

        pool.stop().await;
        assert!(pool.active_targets().is_empty());

        let last = targets[0].status().last_scrape();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(targets[0].status().last_scrape(), last);
    }
}
