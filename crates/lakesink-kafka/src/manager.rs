//! Regex-driven topic discovery and the consume loop.
//!
//! The manager owns the list of topics a consumer group should be
//! subscribed to. Topics are discovered by matching the cluster's topic
//! list against a comma-separated set of regexes, refreshed on a timer;
//! the consume loop snapshots the list before every session so a refresh
//! that lands mid-session takes effect at the next rebalance.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::ConsumerGroup;
use crate::error::{KafkaError, Result};
use crate::watcher::Watcher;

/// Wait between consume attempts while discovery has found nothing.
const EMPTY_TOPICS_BACKOFF: Duration = Duration::from_secs(5);

pub struct TopicManager {
    group: Arc<dyn ConsumerGroup>,
    watcher: Arc<dyn Watcher>,
    topic_regexes: Vec<Regex>,
    topics: Mutex<Vec<String>>,
}

/// Compile a comma-separated regex list. A malformed expression is a
/// startup error.
pub fn compile_regexes(regexes: &str) -> Result<Vec<Regex>> {
    regexes
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|expr| {
            Regex::new(expr).map_err(|e| KafkaError::Config(format!("compiling regex {expr}: {e}")))
        })
        .collect()
}

/// Filter and deduplicate `all_topics` against the compiled regex set,
/// preserving cluster order.
pub fn filter_topics(regexes: &[Regex], all_topics: &[String]) -> Vec<String> {
    let mut matched = Vec::new();
    for topic in all_topics {
        if matched.contains(topic) {
            continue;
        }
        if regexes.iter().any(|r| r.is_match(topic)) {
            matched.push(topic.clone());
        }
    }
    matched
}

impl TopicManager {
    pub fn new(
        group: Arc<dyn ConsumerGroup>,
        watcher: Arc<dyn Watcher>,
        regexes: &str,
    ) -> Result<Self> {
        Ok(Self {
            group,
            watcher,
            topic_regexes: compile_regexes(regexes)?,
            topics: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the current topic list.
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().expect("topic list lock").clone()
    }

    fn update_topics(&self, all_topics: &[String]) {
        let matched = filter_topics(&self.topic_regexes, all_topics);
        debug!(count = matched.len(), "topics matched regex set");
        *self.topics.lock().expect("topic list lock") = matched;
    }

    /// Pull the cluster topic list and refresh the matched set.
    pub async fn refresh_topics(&self) -> Result<()> {
        let all_topics = self.watcher.topics().await?;
        debug!(count = all_topics.len(), "topics in the cluster");
        self.update_topics(&all_topics);
        Ok(())
    }

    /// Refresh topics every `period` until cancellation.
    ///
    /// The first refresh happens immediately; failures after startup are
    /// logged and retried at the next tick rather than tearing anything
    /// down, since the previous topic list is still serviceable.
    pub async fn sync_topics(&self, ctx: CancellationToken, period: Duration) {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            if let Err(e) = self.refresh_topics().await {
                warn!(error = %e, "topic refresh failed, keeping previous list");
            }
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tick.tick() => continue,
            }
        }
    }

    /// Run consumer group sessions until cancellation.
    ///
    /// Each loop iteration snapshots the topic list and runs one blocking
    /// session; returning from the session (rebalance) re-snapshots, so
    /// newly discovered topics are picked up. Session errors trigger
    /// teardown and a fresh session from the last committed offsets.
    pub async fn consume(&self, ctx: CancellationToken) {
        loop {
            if ctx.is_cancelled() {
                return;
            }

            let topics = self.topics();
            if topics.is_empty() {
                warn!("no topics found, waiting");
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(EMPTY_TOPICS_BACKOFF) => continue,
                }
            }

            info!(count = topics.len(), "starting consumer session");
            match self.group.consume(ctx.clone(), &topics).await {
                Ok(()) => debug!("consumer session ended, re-entering"),
                Err(e) => error!(error = %e, "consumer session failed, re-entering"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_regexes_splits_and_trims() {
        let regexes = compile_regexes(r"^orders\., ^users\.").unwrap();
        assert_eq!(regexes.len(), 2);
    }

    #[test]
    fn test_compile_regexes_rejects_malformed() {
        assert!(compile_regexes(r"^orders\.,([").is_err());
    }

    #[test]
    fn test_filter_topics_matches_and_dedupes() {
        let regexes = compile_regexes(r"^orders\.,^users\.").unwrap();
        let all = vec![
            "orders.x".to_string(),
            "users.y".to_string(),
            "inventory.z".to_string(),
            "orders.x".to_string(),
        ];
        let matched = filter_topics(&regexes, &all);
        assert_eq!(matched, vec!["orders.x".to_string(), "users.y".to_string()]);
    }

    #[test]
    fn test_filter_topics_empty_cluster() {
        let regexes = compile_regexes(r"^orders\.").unwrap();
        assert!(filter_topics(&regexes, &[]).is_empty());
    }
}
