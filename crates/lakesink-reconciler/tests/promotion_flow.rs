//! End-to-end reconciler tests: topic discovery, group assignment on a
//! mask version change, and topic-by-topic promotion once reloading
//! topics reach realtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use lakesink_kafka::{KafkaError, Watcher};
use lakesink_reconciler::{
    FileStatusStore, GroupDeployer, GroupId, RealtimeCalculator, SinkGroupReconciler,
    SinkGroupSpec, SinkSpec, StatusStore,
};

struct FakeWatcher {
    topics: Vec<String>,
    last_offsets: HashMap<String, i64>,
    current_offsets: HashMap<(String, String), i64>,
}

#[async_trait]
impl Watcher for FakeWatcher {
    async fn topics(&self) -> lakesink_kafka::Result<Vec<String>> {
        Ok(self.topics.clone())
    }

    async fn last_offset(&self, topic: &str, _partition: i32) -> lakesink_kafka::Result<i64> {
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
        Ok(self
            .current_offsets
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(-1))
    }
}

#[derive(Default)]
struct RecordingDeployer {
    calls: Mutex<Vec<(GroupId, Vec<String>, Option<String>)>>,
}

#[async_trait]
impl GroupDeployer for RecordingDeployer {
    async fn reconcile(
        &self,
        _sink: &SinkSpec,
        group: &SinkGroupSpec,
    ) -> lakesink_reconciler::Result<()> {
        self.calls.lock().unwrap().push((
            group.group,
            group.topics.clone(),
            group.mask_file_version.clone(),
        ));
        Ok(())
    }
}

fn spec(mask_file_version: Option<&str>) -> SinkSpec {
    SinkSpec {
        name: "orders-sink".to_string(),
        namespace: "data".to_string(),
        kafka_topic_regexes: r"^db\.".to_string(),
        kafka_loader_topic_prefix: "loader-".to_string(),
        release_condition: None,
        topic_release_condition: HashMap::new(),
        mask_file_version: mask_file_version.map(str::to_string),
    }
}

/// Watcher with both db topics; `realtime` lists the topics whose reload
/// groups have caught up.
fn watcher(realtime: &[&str]) -> Arc<FakeWatcher> {
    let mut topics = vec![
        "db.orders".to_string(),
        "db.users".to_string(),
        "inventory.z".to_string(),
    ];
    let mut last_offsets = HashMap::new();
    let mut current_offsets = HashMap::new();
    for topic in ["db.orders", "db.users"] {
        let loader_topic = format!("loader-reload-{topic}");
        topics.push(loader_topic.clone());
        last_offsets.insert(topic.to_string(), 1000);
        last_offsets.insert(loader_topic.clone(), 50);
        if realtime.contains(&topic) {
            current_offsets.insert(
                ("orders-sink-data-reload-batcher".to_string(), topic.to_string()),
                995,
            );
            current_offsets.insert(
                ("orders-sink-data-reload-loader".to_string(), loader_topic),
                48,
            );
        }
    }
    Arc::new(FakeWatcher {
        topics,
        last_offsets,
        current_offsets,
    })
}

fn reconciler(
    spec: SinkSpec,
    watcher: Arc<FakeWatcher>,
    status_store: Arc<FileStatusStore>,
    deployer: Arc<RecordingDeployer>,
) -> SinkGroupReconciler {
    let calculator = RealtimeCalculator::new(
        Arc::clone(&watcher) as Arc<dyn Watcher>,
        Arc::new(DashMap::new()),
    );
    SinkGroupReconciler::new(
        spec,
        watcher as Arc<dyn Watcher>,
        calculator,
        deployer,
        status_store,
        Arc::new(DashMap::new()),
    )
}

#[tokio::test]
async fn discovery_assigns_new_topics_to_main() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStatusStore::new(dir.path().join("status.json")));
    let deployer = Arc::new(RecordingDeployer::default());

    reconciler(spec(None), watcher(&[]), Arc::clone(&store), Arc::clone(&deployer))
        .reconcile_once()
        .await
        .unwrap();

    let status = store.load().unwrap();
    assert_eq!(status.topic_groups.len(), 2);
    assert_eq!(status.topic_groups["db.orders"].id, GroupId::Main);
    assert_eq!(status.topic_groups["db.users"].id, GroupId::Main);
    assert!(!status.topic_groups.contains_key("inventory.z"));
    assert!(status.realtime.is_empty());

    // only the main group was non-empty
    let calls = deployer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, GroupId::Main);
    assert_eq!(
        calls[0].1,
        vec!["db.orders".to_string(), "db.users".to_string()]
    );
}

#[tokio::test]
async fn mask_version_change_moves_main_to_reload_and_promotes_realtime() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStatusStore::new(dir.path().join("status.json")));

    // Tick 1: steady state on the old version.
    reconciler(
        spec(None),
        watcher(&[]),
        Arc::clone(&store),
        Arc::new(RecordingDeployer::default()),
    )
    .reconcile_once()
    .await
    .unwrap();

    // Tick 2: version flips to v2. Both topics reload; only db.orders has
    // caught-up batcher and loader groups, so it promotes within the tick.
    let deployer = Arc::new(RecordingDeployer::default());
    reconciler(
        spec(Some("v2")),
        watcher(&["db.orders"]),
        Arc::clone(&store),
        Arc::clone(&deployer),
    )
    .reconcile_once()
    .await
    .unwrap();

    let status = store.load().unwrap();
    assert_eq!(status.mask_version.as_deref(), Some("v2"));
    assert_eq!(status.topic_groups["db.orders"].id, GroupId::Main);
    assert_eq!(status.topic_groups["db.users"].id, GroupId::Reload);
    assert_eq!(status.realtime, vec!["db.orders".to_string()]);

    // main, reload, and the dupe mirroring reload were all reconciled
    let calls = deployer.calls.lock().unwrap();
    let by_group: HashMap<GroupId, &(GroupId, Vec<String>, Option<String>)> =
        calls.iter().map(|c| (c.0, c)).collect();
    assert_eq!(by_group[&GroupId::Main].1, vec!["db.orders".to_string()]);
    assert_eq!(by_group[&GroupId::Reload].1, vec!["db.users".to_string()]);
    assert_eq!(by_group[&GroupId::ReloadDupe].1, vec!["db.users".to_string()]);
    // reload builds the new version, the dupe keeps serving the old one
    assert_eq!(by_group[&GroupId::Reload].2.as_deref(), Some("v2"));
    assert_eq!(by_group[&GroupId::ReloadDupe].2, None);

    // Tick 3: db.users catches up and promotes; nothing reloads anymore.
    let deployer = Arc::new(RecordingDeployer::default());
    reconciler(
        spec(Some("v2")),
        watcher(&["db.orders", "db.users"]),
        Arc::clone(&store),
        Arc::clone(&deployer),
    )
    .reconcile_once()
    .await
    .unwrap();

    let status = store.load().unwrap();
    assert_eq!(status.topic_groups["db.users"].id, GroupId::Main);
    assert_eq!(status.realtime, vec!["db.users".to_string()]);
    let calls = deployer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, GroupId::Main);
}

#[tokio::test]
async fn observed_loader_offsets_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStatusStore::new(dir.path().join("status.json")));

    // Seed: both topics reloading on v2, neither batcher realtime.
    reconciler(
        spec(Some("v2")),
        watcher(&[]),
        Arc::clone(&store),
        Arc::new(RecordingDeployer::default()),
    )
    .reconcile_once()
    .await
    .unwrap();
    assert_eq!(
        store.load().unwrap().topic_groups["db.orders"].id,
        GroupId::Reload
    );

    // A loader group with a live commit but a lagging batcher: the offset
    // must still be persisted for later inactivity.
    let mut watcher_state = watcher(&[]);
    {
        let state = Arc::get_mut(&mut watcher_state).unwrap();
        // batcher group exists but lags far beyond the threshold
        state.current_offsets.insert(
            (
                "orders-sink-data-reload-batcher".to_string(),
                "db.orders".to_string(),
            ),
            500,
        );
        state.current_offsets.insert(
            (
                "orders-sink-data-reload-loader".to_string(),
                "loader-reload-db.orders".to_string(),
            ),
            42,
        );
    }
    reconciler(
        spec(Some("v2")),
        watcher_state,
        Arc::clone(&store),
        Arc::new(RecordingDeployer::default()),
    )
    .reconcile_once()
    .await
    .unwrap();

    let status = store.load().unwrap();
    assert_eq!(status.topic_groups["db.orders"].id, GroupId::Reload);
    assert_eq!(
        status.topic_groups["db.orders"].loader_current_offset,
        Some(42)
    );
}
