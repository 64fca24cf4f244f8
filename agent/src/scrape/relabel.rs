use regex::Regex;
use serde::{Deserialize, Deserializer};

use common::labels::Labels;

/// What a rule does once its regex verdict is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Replace,
    Keep,
    Drop,
}

/// One relabel rule. Rules run in list order; a keep/drop verdict
/// short-circuits the rest of the list for that sample.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source_labels: Vec<String>,
    /// Joins source label values into the matching string. Values are not
    /// escaped; pick a separator that does not occur in them.
    pub separator: String,
    #[serde(deserialize_with = "deserialize_regex")]
    pub regex: Regex,
    pub target_label: String,
    /// Replacement template for `replace`; capture groups expand as `$1`
    /// or `${1}`.
    pub replacement: String,
    pub action: Action,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: ";".to_string(),
            regex: Regex::new("(.*)").expect("default regex"),
            target_label: String::new(),
            replacement: "$1".to_string(),
            action: Action::Replace,
        }
    }
}

fn deserialize_regex<'de, D>(deserializer: D) -> Result<Regex, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern = String::deserialize(deserializer)?;
    Regex::new(&pattern).map_err(serde::de::Error::custom)
}

/// Runs the rule list over one label set. `None` means the sample is dropped
/// and must not be forwarded. Metric values are never touched.
pub fn process(mut labels: Labels, rules: &[Config]) -> Option<Labels> {
    for rule in rules {
        let value = rule
            .source_labels
            .iter()
            .map(|name| labels.get(name).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&rule.separator);

        match rule.action {
            Action::Drop => {
                if rule.regex.is_match(&value) {
                    return None;
                }
            }
            Action::Keep => {
                if !rule.regex.is_match(&value) {
                    return None;
                }
            }
            Action::Replace => {
                if let Some(caps) = rule.regex.captures(&value) {
                    let mut replaced = String::new();
                    caps.expand(&rule.replacement, &mut replaced);
                    if replaced.is_empty() {
                        // An empty expansion deletes the target label rather
                        // than leaving an empty value behind.
                        labels.del(&rule.target_label);
                    } else {
                        labels.set(rule.target_label.as_str(), replaced);
                    }
                }
            }
        }
    }
    Some(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().copied().collect()
    }

    #[test]
    fn drop_discards_matching_samples() {
        let rules = vec![Config {
            source_labels: vec!["__name__".to_string()],
            regex: Regex::new(".*drop.*").unwrap(),
            action: Action::Drop,
            ..Default::default()
        }];

        assert!(process(labels(&[("__name__", "test_metric_drop")]), &rules).is_none());
        let kept = process(labels(&[("__name__", "test_metric")]), &rules).unwrap();
        assert_eq!(kept.get("__name__"), Some("test_metric"));
    }

    #[test]
    fn keep_discards_non_matching_samples() {
        let rules = vec![Config {
            source_labels: vec!["job".to_string()],
            regex: Regex::new("^node$").unwrap(),
            action: Action::Keep,
            ..Default::default()
        }];

        assert!(process(labels(&[("job", "node")]), &rules).is_some());
        assert!(process(labels(&[("job", "other")]), &rules).is_none());
        assert!(process(labels(&[]), &rules).is_none());
    }

    #[test]
    fn replace_sets_target_label_on_match_only() {
        let rules = vec![Config {
            source_labels: vec!["__name__".to_string()],
            regex: Regex::new(".*(relabel|up).*").unwrap(),
            target_label: "foo".to_string(),
            replacement: "bar".to_string(),
            action: Action::Replace,
            ..Default::default()
        }];

        let hit = process(labels(&[("__name__", "test_metric_relabel")]), &rules).unwrap();
        assert_eq!(hit.get("foo"), Some("bar"));

        let miss = process(labels(&[("__name__", "test_metric")]), &rules).unwrap();
        assert_eq!(miss.get("foo"), None);
    }

    #[test]
    fn replace_expands_capture_groups() {
        let rules = vec![Config {
            source_labels: vec!["instance".to_string()],
            regex: Regex::new("(.+):(.+)").unwrap(),
            target_label: "port".to_string(),
            replacement: "$2".to_string(),
            action: Action::Replace,
            ..Default::default()
        }];

        let out = process(labels(&[("instance", "localhost:9090")]), &rules).unwrap();
        assert_eq!(out.get("port"), Some("9090"));
        assert_eq!(out.get("instance"), Some("localhost:9090"));
    }

    #[test]
    fn empty_replacement_deletes_target_label() {
        let rules = vec![Config {
            source_labels: vec!["drop_me".to_string()],
            regex: Regex::new("yes").unwrap(),
            target_label: "doomed".to_string(),
            replacement: String::new(),
            action: Action::Replace,
            ..Default::default()
        }];

        let out = process(labels(&[("drop_me", "yes"), ("doomed", "x")]), &rules).unwrap();
        assert_eq!(out.get("doomed"), None);
    }

    #[test]
    fn source_values_join_with_separator_in_order() {
        let rules = vec![Config {
            source_labels: vec!["a".to_string(), "b".to_string(), "missing".to_string()],
            regex: Regex::new("^1;2;$").unwrap(),
            action: Action::Keep,
            ..Default::default()
        }];

        // Missing source labels contribute an empty string.
        assert!(process(labels(&[("a", "1"), ("b", "2")]), &rules).is_some());
        assert!(process(labels(&[("a", "2"), ("b", "1")]), &rules).is_none());
    }

    #[test]
    fn drop_short_circuits_later_rules() {
        let rules = vec![
            Config {
                source_labels: vec!["__name__".to_string()],
                regex: Regex::new(".*").unwrap(),
                action: Action::Drop,
                ..Default::default()
            },
            Config {
                target_label: "never".to_string(),
                replacement: "set".to_string(),
                action: Action::Replace,
                ..Default::default()
            },
        ];

        assert!(process(labels(&[("__name__", "anything")]), &rules).is_none());
    }
}
