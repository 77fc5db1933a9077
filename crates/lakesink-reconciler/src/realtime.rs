//! The realtime calculator.
//!
//! Given the topics currently reloading and the set flagged realtime
//! last round, decide the new realtime set from batcher and loader lag.
//! Offset queries are cached per topic; each cache entry stays valid for
//! a uniformly random 120 to 240 seconds from insertion, so parallel
//! controllers do not stampede the brokers in step.
//!
//! Two deliberate asymmetries, both load-bearing:
//! - a loader group whose committed offset the broker has forgotten
//!   (`current == -1`) falls back to the offset persisted on the
//!   TopicGroup, so inactivity cannot revoke realtime status;
//! - an offset query failure keeps a previously-realtime topic realtime
//!   for the round, since consumer groups vanish transiently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use lakesink_kafka::{consumer_group_id, KafkaError, Watcher};

use crate::spec::SinkSpec;
use crate::status::TopicGroup;

/// Cache validity bounds, seconds.
const CACHE_VALID_MIN_SECS: u64 = 120;
const CACHE_VALID_MAX_SECS: u64 = 240;

/// Last/current offsets for one side of a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetPosition {
    pub last: Option<i64>,
    pub current: Option<i64>,
}

/// Cached lag state for one topic.
#[derive(Debug, Clone)]
pub struct RealtimeInfo {
    pub batcher: OffsetPosition,
    pub loader: OffsetPosition,
    pub batcher_realtime: bool,
    pub loader_realtime: bool,
    inserted_at: Instant,
    valid_for: Duration,
}

impl RealtimeInfo {
    fn fresh() -> Self {
        let valid_secs =
            rand::thread_rng().gen_range(CACHE_VALID_MIN_SECS..CACHE_VALID_MAX_SECS);
        Self {
            batcher: OffsetPosition::default(),
            loader: OffsetPosition::default(),
            batcher_realtime: false,
            loader_realtime: false,
            inserted_at: Instant::now(),
            valid_for: Duration::from_secs(valid_secs),
        }
    }

    fn is_valid(&self) -> bool {
        self.inserted_at.elapsed() < self.valid_for
    }
}

/// What one `calculate` run decided.
#[derive(Debug, Default)]
pub struct RealtimeResult {
    /// Topics whose batcher and loader are both within threshold.
    pub realtime: Vec<String>,
    /// Freshly observed loader offsets to persist on the TopicGroups.
    pub loader_offset_updates: HashMap<String, i64>,
    pub batchers_realtime: Vec<String>,
    pub loaders_realtime: Vec<String>,
}

/// Outcome of one topic's offset fetch; a partial `info` still counts
/// toward the (not) realtime decision when the fetch errored.
struct FetchOutcome {
    info: RealtimeInfo,
    loader_offset_update: Option<i64>,
    error: Option<KafkaError>,
}

pub struct RealtimeCalculator {
    watcher: Arc<dyn Watcher>,
    cache: Arc<DashMap<String, RealtimeInfo>>,
}

impl RealtimeCalculator {
    pub fn new(watcher: Arc<dyn Watcher>, cache: Arc<DashMap<String, RealtimeInfo>>) -> Self {
        Self { watcher, cache }
    }

    fn cached(&self, topic: &str) -> Option<RealtimeInfo> {
        let info = self.cache.get(topic)?;
        if info.is_valid() {
            debug!(topic, "realtime cache hit");
            return Some(info.clone());
        }
        None
    }

    /// Query both sides' offsets for one topic.
    async fn fetch_realtime_info(
        &self,
        spec: &SinkSpec,
        topic: &str,
        loader_topic: Option<&str>,
        group: &TopicGroup,
    ) -> FetchOutcome {
        debug!(topic, "fetching realtime info");
        let mut outcome = FetchOutcome {
            info: RealtimeInfo::fresh(),
            loader_offset_update: None,
            error: None,
        };

        let batcher_last = match self.watcher.last_offset(topic, 0).await {
            Ok(offset) => offset,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.info.batcher.last = Some(batcher_last);

        let batcher_group = consumer_group_id(&spec.name, &spec.namespace, group.id.as_str(), "-batcher");
        let batcher_current = match self
            .watcher
            .current_offset(&batcher_group, topic, 0)
            .await
        {
            Ok(offset) => offset,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        if batcher_current == -1 {
            // Group unknown to the broker: the batcher has not started,
            // so the topic cannot be realtime.
            debug!(topic, "batcher consumer group not found");
            return outcome;
        }
        outcome.info.batcher.current = Some(batcher_current);

        let Some(loader_topic) = loader_topic else {
            return outcome;
        };

        let loader_last = match self.watcher.last_offset(loader_topic, 0).await {
            Ok(offset) => offset,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.info.loader.last = Some(loader_last);

        let loader_group = consumer_group_id(&spec.name, &spec.namespace, group.id.as_str(), "-loader");
        let loader_current = match self
            .watcher
            .current_offset(&loader_group, loader_topic, 0)
            .await
        {
            Ok(offset) => offset,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        if loader_current == -1 {
            // Either the group never existed, or it idled long enough for
            // the broker to expire its commit. The persisted offset
            // distinguishes the two.
            match group.loader_current_offset {
                None => {
                    debug!(loader_topic, "loader consumer group not found");
                }
                Some(persisted) => {
                    debug!(loader_topic, persisted, "loader group inactive, using persisted offset");
                    outcome.info.loader.current = Some(persisted);
                }
            }
        } else {
            outcome.info.loader.current = Some(loader_current);
            outcome.loader_offset_update = Some(loader_current);
        }

        outcome
    }

    /// Compute the new realtime set for the reloading topics.
    ///
    /// `current_realtime` is last round's output, passed back in by the
    /// caller; it feeds the failure fallback and is returned unchanged
    /// when nothing is reloading.
    pub async fn calculate(
        &self,
        spec: &SinkSpec,
        topic_groups: &HashMap<String, TopicGroup>,
        reloading: &[String],
        current_realtime: &[String],
    ) -> RealtimeResult {
        if reloading.is_empty() {
            return RealtimeResult {
                realtime: current_realtime.to_vec(),
                ..RealtimeResult::default()
            };
        }

        let current: HashSet<&str> = current_realtime.iter().map(String::as_str).collect();
        let mut result = RealtimeResult::default();

        let all_topics = match self.watcher.topics().await {
            Ok(topics) => topics,
            Err(e) => {
                error!(error = %e, "ignoring realtime update, topic listing failed");
                result.realtime = current_realtime.to_vec();
                return result;
            }
        };
        let all_topics: HashSet<&str> = all_topics.iter().map(String::as_str).collect();

        for topic in reloading {
            let Some(group) = topic_groups.get(topic) else {
                error!(topic = %topic, "topic group missing from status");
                continue;
            };

            let ltopic = spec.loader_topic(group.id, topic);
            let loader_topic = if all_topics.contains(ltopic.as_str()) {
                Some(ltopic.as_str())
            } else {
                debug!(loader_topic = %ltopic, "loader topic not found, not realtime");
                None
            };

            // A cached entry keeps its original insertion clock when it is
            // re-stored below, so no entry outlives its validity window.
            let mut info = match self.cached(topic) {
                Some(info) => info,
                None => {
                    let outcome = self
                        .fetch_realtime_info(spec, topic, loader_topic, group)
                        .await;
                    if let Some(offset) = outcome.loader_offset_update {
                        result.loader_offset_updates.insert(topic.clone(), offset);
                    }
                    if let Some(e) = outcome.error {
                        warn!(topic = %topic, error = %e, "error fetching realtime info");
                        if current.contains(topic.as_str()) {
                            // Offsets were unreadable but the topic was
                            // already realtime; keep it that way for this
                            // round rather than flapping.
                            let mut kept = RealtimeInfo::fresh();
                            kept.batcher_realtime = true;
                            kept.loader_realtime = true;
                            self.cache.insert(topic.clone(), kept);
                            result.realtime.push(topic.clone());
                            result.batchers_realtime.push(topic.clone());
                            result.loaders_realtime.push(ltopic.clone());
                            continue;
                        }
                    }
                    outcome.info
                }
            };

            let (max_batcher_lag, max_loader_lag) = spec.max_lag(topic);
            if let (Some(last), Some(current_offset)) = (info.batcher.last, info.batcher.current) {
                let lag = last - current_offset;
                debug!(topic = %topic, lag, "batcher lag");
                if lag <= max_batcher_lag {
                    info.batcher_realtime = true;
                    result.batchers_realtime.push(topic.clone());
                }
            }
            if let (Some(last), Some(current_offset)) = (info.loader.last, info.loader.current) {
                let lag = last - current_offset;
                debug!(loader_topic = %ltopic, lag, "loader lag");
                if lag <= max_loader_lag {
                    info.loader_realtime = true;
                    result.loaders_realtime.push(ltopic.clone());
                }
            }

            if info.batcher_realtime && info.loader_realtime {
                info!(topic = %topic, "realtime");
                result.realtime.push(topic.clone());
            } else {
                debug!(
                    topic = %topic,
                    batcher = info.batcher_realtime,
                    loader = info.loader_realtime,
                    "waiting to reach realtime"
                );
            }

            self.cache.insert(topic.clone(), info);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeWatcher {
        topics: Vec<String>,
        last_offsets: HashMap<String, i64>,
        current_offsets: HashMap<(String, String), i64>,
        fail_offsets: bool,
        offset_queries: AtomicUsize,
    }

    impl FakeWatcher {
        fn new() -> Self {
            Self {
                topics: Vec::new(),
                last_offsets: HashMap::new(),
                current_offsets: HashMap::new(),
                fail_offsets: false,
                offset_queries: AtomicUsize::new(0),
            }
        }

        fn queries(&self) -> usize {
            self.offset_queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Watcher for FakeWatcher {
        async fn topics(&self) -> lakesink_kafka::Result<Vec<String>> {
            Ok(self.topics.clone())
        }

        async fn last_offset(&self, topic: &str, _partition: i32) -> lakesink_kafka::Result<i64> {
            self.offset_queries.fetch_add(1, Ordering::SeqCst);
            if self.fail_offsets {
                return Err(KafkaError::Watcher("broker unreachable".to_string()));
            }
            self.last_offsets
                .get(topic)
                .copied()
                .ok_or_else(|| KafkaError::Watcher(format!("no watermark for {topic}")))
        }

        async fn current_offset(
            &self,
            group_id: &str,
            topic: &str,
            _partition: i32,
        ) -> lakesink_kafka::Result<i64> {
            self.offset_queries.fetch_add(1, Ordering::SeqCst);
            if self.fail_offsets {
                return Err(KafkaError::Watcher("broker unreachable".to_string()));
            }
            Ok(self
                .current_offsets
                .get(&(group_id.to_string(), topic.to_string()))
                .copied()
                .unwrap_or(-1))
        }
    }

    const TOPIC: &str = "db.orders";
    const LOADER_TOPIC: &str = "loader-reload-db.orders";
    const BATCHER_GROUP: &str = "orders-sink-data-reload-batcher";
    const LOADER_GROUP: &str = "orders-sink-data-reload-loader";

    fn spec() -> SinkSpec {
        SinkSpec {
            name: "orders-sink".to_string(),
            namespace: "data".to_string(),
            kafka_topic_regexes: r"^db\.".to_string(),
            kafka_loader_topic_prefix: "loader-".to_string(),
            release_condition: None,
            topic_release_condition: HashMap::new(),
            mask_file_version: None,
        }
    }

    fn groups(loader_current_offset: Option<i64>) -> HashMap<String, TopicGroup> {
        let mut groups = HashMap::new();
        groups.insert(
            TOPIC.to_string(),
            TopicGroup {
                id: crate::spec::GroupId::Reload,
                loader_current_offset,
            },
        );
        groups
    }

    fn healthy_watcher() -> FakeWatcher {
        let mut watcher = FakeWatcher::new();
        watcher.topics = vec![TOPIC.to_string(), LOADER_TOPIC.to_string()];
        watcher.last_offsets.insert(TOPIC.to_string(), 1000);
        watcher.last_offsets.insert(LOADER_TOPIC.to_string(), 10);
        watcher
            .current_offsets
            .insert((BATCHER_GROUP.to_string(), TOPIC.to_string()), 990);
        watcher
            .current_offsets
            .insert((LOADER_GROUP.to_string(), LOADER_TOPIC.to_string()), 5);
        watcher
    }

    fn calculator(watcher: FakeWatcher) -> (Arc<FakeWatcher>, RealtimeCalculator) {
        let watcher = Arc::new(watcher);
        let calc = RealtimeCalculator::new(
            Arc::clone(&watcher) as Arc<dyn Watcher>,
            Arc::new(DashMap::new()),
        );
        (watcher, calc)
    }

    #[tokio::test]
    async fn lag_within_limits_is_realtime() {
        let (_, calc) = calculator(healthy_watcher());
        let result = calc
            .calculate(&spec(), &groups(None), &[TOPIC.to_string()], &[])
            .await;

        assert_eq!(result.realtime, vec![TOPIC.to_string()]);
        assert_eq!(result.batchers_realtime, vec![TOPIC.to_string()]);
        assert_eq!(result.loaders_realtime, vec![LOADER_TOPIC.to_string()]);
        // the freshly observed loader offset is reported for persistence
        assert_eq!(result.loader_offset_updates.get(TOPIC), Some(&5));
    }

    #[tokio::test]
    async fn batcher_lag_beyond_threshold_is_not_realtime() {
        let mut watcher = healthy_watcher();
        watcher
            .current_offsets
            .insert((BATCHER_GROUP.to_string(), TOPIC.to_string()), 800);
        let (_, calc) = calculator(watcher);

        let result = calc
            .calculate(&spec(), &groups(None), &[TOPIC.to_string()], &[])
            .await;
        assert!(result.realtime.is_empty());
        assert!(result.batchers_realtime.is_empty());
        // loader side was still within threshold
        assert_eq!(result.loaders_realtime, vec![LOADER_TOPIC.to_string()]);
    }

    #[tokio::test]
    async fn stale_loader_group_uses_persisted_offset() {
        let mut watcher = healthy_watcher();
        watcher
            .current_offsets
            .remove(&(LOADER_GROUP.to_string(), LOADER_TOPIC.to_string()));
        watcher.last_offsets.insert(LOADER_TOPIC.to_string(), 5050);
        let (_, calc) = calculator(watcher);

        let mut spec = spec();
        spec.release_condition = Some(crate::spec::ReleaseCondition {
            max_batcher_lag: Some(100),
            max_loader_lag: Some(100),
        });

        let result = calc
            .calculate(&spec, &groups(Some(5000)), &[TOPIC.to_string()], &[])
            .await;
        assert_eq!(result.realtime, vec![TOPIC.to_string()]);
        // no fresh loader offset was observed, so none is persisted
        assert!(result.loader_offset_updates.is_empty());
    }

    #[tokio::test]
    async fn stale_loader_group_without_persisted_offset_is_not_realtime() {
        let mut watcher = healthy_watcher();
        watcher
            .current_offsets
            .remove(&(LOADER_GROUP.to_string(), LOADER_TOPIC.to_string()));
        let (_, calc) = calculator(watcher);

        let result = calc
            .calculate(&spec(), &groups(None), &[TOPIC.to_string()], &[])
            .await;
        assert!(result.realtime.is_empty());
    }

    #[tokio::test]
    async fn missing_batcher_group_is_not_realtime() {
        let mut watcher = healthy_watcher();
        watcher
            .current_offsets
            .remove(&(BATCHER_GROUP.to_string(), TOPIC.to_string()));
        let (_, calc) = calculator(watcher);

        let result = calc
            .calculate(&spec(), &groups(None), &[TOPIC.to_string()], &[])
            .await;
        assert!(result.realtime.is_empty());
    }

    #[tokio::test]
    async fn missing_loader_topic_is_not_realtime() {
        let mut watcher = healthy_watcher();
        watcher.topics = vec![TOPIC.to_string()];
        let (_, calc) = calculator(watcher);

        let result = calc
            .calculate(&spec(), &groups(None), &[TOPIC.to_string()], &[])
            .await;
        assert!(result.realtime.is_empty());
    }

    #[tokio::test]
    async fn empty_reloading_returns_current_unchanged() {
        let (watcher, calc) = calculator(healthy_watcher());
        let current = vec!["db.users".to_string()];

        let result = calc.calculate(&spec(), &groups(None), &[], &current).await;
        assert_eq!(result.realtime, current);
        assert_eq!(watcher.queries(), 0);
    }

    #[tokio::test]
    async fn fetch_error_keeps_previously_realtime_topic() {
        let mut watcher = healthy_watcher();
        watcher.fail_offsets = true;
        let (_, calc) = calculator(watcher);

        let current = vec![TOPIC.to_string()];
        let result = calc
            .calculate(&spec(), &groups(None), &[TOPIC.to_string()], &current)
            .await;
        assert_eq!(result.realtime, vec![TOPIC.to_string()]);
    }

    #[tokio::test]
    async fn fetch_error_excludes_new_topic() {
        let mut watcher = healthy_watcher();
        watcher.fail_offsets = true;
        let (_, calc) = calculator(watcher);

        let result = calc
            .calculate(&spec(), &groups(None), &[TOPIC.to_string()], &[])
            .await;
        assert!(result.realtime.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_serves_within_window_and_expires_after() {
        let (watcher, calc) = calculator(healthy_watcher());
        let spec = spec();
        let groups = groups(None);
        let reloading = vec![TOPIC.to_string()];

        let first = calc.calculate(&spec, &groups, &reloading, &[]).await;
        assert_eq!(first.realtime, reloading);
        let queries_after_first = watcher.queries();
        assert!(queries_after_first > 0);

        // 60s later: inside every possible validity window, served from cache
        tokio::time::advance(Duration::from_secs(60)).await;
        let second = calc.calculate(&spec, &groups, &reloading, &[]).await;
        assert_eq!(second.realtime, reloading);
        assert_eq!(watcher.queries(), queries_after_first);

        // 300s more: beyond every possible window, must re-query
        tokio::time::advance(Duration::from_secs(300)).await;
        let third = calc.calculate(&spec, &groups, &reloading, &[]).await;
        assert_eq!(third.realtime, reloading);
        assert!(watcher.queries() > queries_after_first);
    }
}
