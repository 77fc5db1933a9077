//! The sink-group reconciler.
//!
//! One reconciler per sink, one worker at a time. Each tick discovers
//! the sink's topics, partitions them into main/reload/reloadDupe,
//! runs the realtime calculator over the reloading set, promotes the
//! topics that caught up, reconciles the three groups' deployments, and
//! patches the status. The status patch runs even when deployment
//! reconciliation failed, so observed loader offsets and promotions are
//! never lost to an unrelated error.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lakesink_kafka::Watcher;

use crate::deploy::GroupDeployer;
use crate::error::{ReconcilerError, Result};
use crate::realtime::RealtimeCalculator;
use crate::spec::{GroupId, SinkGroupSpec, SinkSpec};
use crate::status::{SinkStatus, StatusStore, TopicGroup};

/// Delay between reconcile ticks.
const REQUEUE_AFTER: Duration = Duration::from_secs(30);

pub struct SinkGroupReconciler {
    spec: SinkSpec,
    watcher: Arc<dyn Watcher>,
    calculator: RealtimeCalculator,
    deployer: Arc<dyn GroupDeployer>,
    status_store: Arc<dyn StatusStore>,
    /// Compiled regexes shared across reconcilers, store-if-absent keyed
    /// by source expression.
    topic_regexes: Arc<DashMap<String, Regex>>,
}

impl SinkGroupReconciler {
    pub fn new(
        spec: SinkSpec,
        watcher: Arc<dyn Watcher>,
        calculator: RealtimeCalculator,
        deployer: Arc<dyn GroupDeployer>,
        status_store: Arc<dyn StatusStore>,
        topic_regexes: Arc<DashMap<String, Regex>>,
    ) -> Self {
        Self {
            spec,
            watcher,
            calculator,
            deployer,
            status_store,
            topic_regexes,
        }
    }

    /// Topics in the cluster matching the sink's regex set, deduplicated.
    async fn fetch_latest_topics(&self) -> Result<Vec<String>> {
        let all_topics = self.watcher.topics().await?;
        let mut matched = Vec::new();

        for expression in self.spec.kafka_topic_regexes.split(',') {
            let expression = expression.trim();
            if expression.is_empty() {
                continue;
            }
            let regex = match self.topic_regexes.get(expression) {
                Some(regex) => regex.clone(),
                None => {
                    let compiled = Regex::new(expression).map_err(|e| {
                        ReconcilerError::Config(format!("compiling regex {expression}: {e}"))
                    })?;
                    self.topic_regexes
                        .insert(expression.to_string(), compiled.clone());
                    compiled
                }
            };

            for topic in &all_topics {
                if regex.is_match(topic) && !matched.contains(topic) {
                    matched.push(topic.clone());
                }
            }
        }
        Ok(matched)
    }

    /// Bring the status' topic-group map in line with the discovered
    /// topics and the desired mask version.
    ///
    /// A mask version change moves every main topic into reload; topics
    /// new to the sink start in main when versions agree and in reload
    /// when a reload is already underway. Topics gone from the cluster
    /// drop out of the status.
    fn assign_groups(&self, topics: &[String], status: &mut SinkStatus) {
        let version_changed = status.mask_version != self.spec.mask_file_version;
        if version_changed {
            info!(
                from = status.mask_version.as_deref().unwrap_or("-"),
                to = self.spec.mask_file_version.as_deref().unwrap_or("-"),
                "mask version changed, reloading main topics"
            );
        }

        status
            .topic_groups
            .retain(|topic, _| topics.contains(topic));

        for topic in topics {
            match status.topic_groups.get_mut(topic) {
                Some(group) => {
                    if version_changed && group.id == GroupId::Main {
                        debug!(topic = %topic, "moving to reload");
                        *group = TopicGroup::new(GroupId::Reload);
                    }
                }
                None => {
                    let initial = if version_changed {
                        GroupId::Reload
                    } else {
                        GroupId::Main
                    };
                    status
                        .topic_groups
                        .insert(topic.clone(), TopicGroup::new(initial));
                }
            }
        }

        if version_changed {
            status.mask_version = self.spec.mask_file_version.clone();
        }
    }

    fn topics_in(status: &SinkStatus, id: GroupId) -> Vec<String> {
        let mut topics: Vec<String> = status
            .topic_groups
            .iter()
            .filter(|(_, group)| group.id == id)
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// One reconcile tick.
    pub async fn reconcile_once(&self) -> Result<()> {
        let mut status = self.status_store.load()?;
        let original = status.clone();

        let topics = self.fetch_latest_topics().await?;
        debug!(count = topics.len(), "topics matched for sink");
        self.assign_groups(&topics, &mut status);

        let reloading = Self::topics_in(&status, GroupId::Reload);
        let result = self
            .calculator
            .calculate(&self.spec, &status.topic_groups, &reloading, &status.realtime)
            .await;

        for (topic, offset) in &result.loader_offset_updates {
            if let Some(group) = status.topic_groups.get_mut(topic) {
                group.loader_current_offset = Some(*offset);
            }
        }

        // Promote: reload moves to main, the dupe entry disappears with
        // it, and the persisted loader offset resets with the new group.
        for topic in &result.realtime {
            if let Some(group) = status.topic_groups.get_mut(topic) {
                if group.id == GroupId::Reload {
                    info!(topic = %topic, "promoting reload to main");
                    *group = TopicGroup::new(GroupId::Main);
                }
            }
        }
        status.realtime = result.realtime;

        let mut failures: Vec<String> = Vec::new();
        let main_topics = Self::topics_in(&status, GroupId::Main);
        let reload_topics = Self::topics_in(&status, GroupId::Reload);
        let group_specs = [
            SinkGroupSpec {
                group: GroupId::Main,
                topics: main_topics,
                mask_file_version: status.mask_version.clone(),
            },
            SinkGroupSpec {
                group: GroupId::Reload,
                topics: reload_topics.clone(),
                mask_file_version: self.spec.mask_file_version.clone(),
            },
            // The dupe mirrors the reloading topics on the old version
            // until each is promoted.
            SinkGroupSpec {
                group: GroupId::ReloadDupe,
                topics: reload_topics,
                mask_file_version: original.mask_version.clone(),
            },
        ];
        for group_spec in group_specs.iter().filter(|g| !g.topics.is_empty()) {
            if let Err(e) = self.deployer.reconcile(&self.spec, group_spec).await {
                error!(group = %group_spec.group, error = %e, "group reconcile failed");
                failures.push(format!("{}: {e}", group_spec.group));
            }
        }

        // Deferred status patch: runs regardless of deployment failures.
        if status != original {
            if let Err(e) = self.status_store.patch(&status) {
                failures.push(format!("status patch: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReconcilerError::Aggregate(failures))
        }
    }

    /// Reconcile every 30 seconds until cancellation.
    pub async fn run(&self, ctx: CancellationToken) {
        info!(sink = %self.spec.name, "reconciler started");
        loop {
            if let Err(e) = self.reconcile_once().await {
                error!(sink = %self.spec.name, error = %e, "reconcile failed");
            }
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!(sink = %self.spec.name, "reconciler stopped");
                    return;
                }
                _ = tokio::time::sleep(REQUEUE_AFTER) => {}
            }
        }
    }
}
