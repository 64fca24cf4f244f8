use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::scrape::relabel;

/// Client certificate/key pair used for TLS client authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientCert {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Resolved scrape configuration for one job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Arguments {
    pub job_name: String,
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
    pub scheme: String,
    pub metrics_path: String,
    /// Extra query parameters sent with every scrape request. `__param_<k>`
    /// target labels override the first value of the matching parameter.
    pub params: HashMap<String, Vec<String>>,
    /// When set, labels carried by scraped samples win over target labels on
    /// collision instead of being renamed with an `exported_` prefix.
    pub honor_labels: bool,
    pub metric_relabel_configs: Vec<relabel::Config>,
    pub bearer_token: Option<String>,
    pub bearer_token_file: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<ClientCert>,
}

impl Default for Arguments {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            scrape_interval: Duration::from_secs(15),
            scrape_timeout: Duration::from_secs(10),
            scheme: "http".to_string(),
            metrics_path: "/metrics".to_string(),
            params: HashMap::new(),
            honor_labels: false,
            metric_relabel_configs: Vec::new(),
            bearer_token: None,
            bearer_token_file: None,
            ca_cert: None,
            client_cert: None,
        }
    }
}
