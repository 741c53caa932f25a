//! Topic naming and MQTT-style filter matching
//!
//! Per-machine topics are `<prefix><machine_id>`. Filters use MQTT wildcards:
//! `+` matches one level, a trailing `#` matches any number of levels
//! (including none).

use crate::config::TopicConfig;

#[derive(Debug, Clone)]
pub struct Topics {
    config: TopicConfig,
}

impl Topics {
    pub fn new(config: TopicConfig) -> Self {
        Self { config }
    }

    pub fn raw(&self, entity_id: &str) -> String {
        format!("{}{}", self.config.raw_prefix, entity_id)
    }

    pub fn context(&self, entity_id: &str) -> String {
        format!("{}{}", self.config.context_prefix, entity_id)
    }

    pub fn decision(&self, entity_id: &str) -> String {
        format!("{}{}", self.config.decision_prefix, entity_id)
    }

    pub fn actions(&self, entity_id: &str) -> String {
        format!("{}{}", self.config.actions_prefix, entity_id)
    }

    pub fn heartbeat(&self) -> &str {
        &self.config.heartbeat
    }

    pub fn raw_filter(&self) -> String {
        format!("{}+", self.config.raw_prefix)
    }

    pub fn context_filter(&self) -> String {
        format!("{}+", self.config.context_prefix)
    }

    /// Everything under the decision root, so other decision families
    /// reach the dispatcher and are rejected there by type
    pub fn decision_filter(&self) -> String {
        let root = self
            .config
            .decision_prefix
            .split('/')
            .next()
            .unwrap_or_default();
        format!("{root}/#")
    }

    pub fn actions_filter(&self) -> String {
        format!("{}+", self.config.actions_prefix)
    }

    pub fn is_context(&self, topic: &str) -> bool {
        topic_matches(&self.context_filter(), topic)
    }

    pub fn is_actions(&self, topic: &str) -> bool {
        topic_matches(&self.actions_filter(), topic)
    }

    pub fn is_heartbeat(&self, topic: &str) -> bool {
        topic == self.config.heartbeat
    }
}

/// Last topic level; machine id for per-machine topics
pub fn entity_segment(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

/// Publish topics must be non-empty and wildcard-free
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        let topics = Topics::new(TopicConfig::default());
        assert_eq!(topics.raw("CNC001"), "raw_data/machine_sensors/CNC001");
        assert_eq!(topics.context("CNC001"), "context/machine_status/CNC001");
        assert_eq!(topics.decision("CNC001"), "decision/maintenance/CNC001");
        assert_eq!(topics.actions("CNC001"), "simulated_actions/CNC001");
        assert_eq!(topics.decision_filter(), "decision/#");
        assert!(topics.is_context("context/machine_status/CNC001"));
        assert!(!topics.is_context("context/machine_status/CNC001/extra"));
        assert!(topics.is_heartbeat("agent/discovery/heartbeat"));
    }

    #[test]
    fn test_wildcards() {
        assert!(topic_matches("raw_data/machine_sensors/+", "raw_data/machine_sensors/CNC001"));
        assert!(!topic_matches("raw_data/machine_sensors/+", "raw_data/machine_sensors"));
        assert!(topic_matches("decision/#", "decision/maintenance/CNC001"));
        assert!(topic_matches("decision/#", "decision"));
        assert!(!topic_matches("decision/#", "context/machine_status/CNC001"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn test_entity_segment_and_validity() {
        assert_eq!(entity_segment("simulated_actions/CNC001"), "CNC001");
        assert_eq!(entity_segment("bare"), "bare");
        assert!(is_valid_topic("a/b"));
        assert!(!is_valid_topic("a/+"));
        assert!(!is_valid_topic(""));
    }
}
