use std::collections::HashMap;

pub mod client;
pub mod exposition;
pub mod manager;
pub mod relabel;
pub mod scrape;
pub mod scrape_loop;
pub mod target;

#[cfg(test)]
pub(crate) mod testutil;

/// Label set as produced by service discovery.
pub type LabelSet = HashMap<String, String>;

/// A group of targets sharing a set of labels, as reported by discovery.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub targets: Vec<LabelSet>,
    pub labels: LabelSet,
    pub source: String,
}
