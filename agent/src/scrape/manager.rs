use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc::Receiver;

use common::error::Result;

use crate::appender::Appender;
use crate::scrape::scrape::Arguments;
use crate::scrape::scrape_loop::ScrapePool;
use crate::scrape::Group;

/// Owns one scrape pool per job and feeds them target-set updates from
/// discovery.
pub struct Manager {
    appender: Arc<dyn Appender>,
    pools: HashMap<String, ScrapePool>,
}

impl Manager {
    pub fn new(appender: Arc<dyn Appender>) -> Self {
        Self {
            appender,
            pools: HashMap::new(),
        }
    }

    /// Applies a fresh set of scrape configurations. Jobs that disappeared
    /// are stopped; every configured job gets a newly built pool, so client
    /// construction errors surface here, before any scrape. A replaced job's
    /// targets return with the next target-set update.
    pub async fn apply_config(&mut self, configs: Vec<Arguments>) -> Result<()> {
        let jobs: HashSet<&str> = configs.iter().map(|c| c.job_name.as_str()).collect();
        let stale: Vec<String> = self
            .pools
            .keys()
            .filter(|job| !jobs.contains(job.as_str()))
            .cloned()
            .collect();
        for job in stale {
            if let Some(mut pool) = self.pools.remove(&job) {
                pool.stop().await;
            }
        }

        for cfg in configs {
            let job = cfg.job_name.clone();
            let pool = ScrapePool::new(cfg, Arc::clone(&self.appender))?;
            if let Some(mut previous) = self.pools.insert(job, pool) {
                previous.stop().await;
            }
        }
        Ok(())
    }

    /// Consumes target-set updates until the channel closes, syncing each
    /// job's pool.
    pub async fn run(&mut self, mut target_sets: Receiver<HashMap<String, Vec<Group>>>) {
        while let Some(update) = target_sets.recv().await {
            for (job, groups) in update {
                match self.pools.get_mut(&job) {
                    Some(pool) => pool.sync(&groups).await,
                    None => error!("received targets for unknown job {job:?}"),
                }
            }
        }
    }

    /// Stops every pool and waits for their run-loops to wind down.
    pub async fn stop(&mut self) {
        for pool in self.pools.values_mut() {
            pool.stop().await;
        }
        self.pools.clear();
        info!("scrape manager stopped");
    }
}
