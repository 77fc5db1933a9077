//! Consumer group sessions and claim fan-out.
//!
//! A session wraps one subscribe/rebalance cycle of the underlying
//! consumer group. For every (topic, partition) the broker assigns, the
//! session opens a [`Claim`] carrying a stream of decoded records and
//! hands it to the [`ClaimHandler`]; the handler runs until the claim
//! ends or the session context is cancelled. A partition revocation ends
//! the session, the caller re-enters `consume`, and the next session's
//! claim set reflects the new assignment.
//!
//! Offsets are tracked in the session and committed from it: `mark_offset`
//! records the next offset to consume, a periodic task commits marked
//! offsets asynchronously when auto-commit is on, and `commit` flushes
//! them synchronously for processors that commit per round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::client::ClientContext;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lakesink_core::CdcRecord;

use crate::error::{KafkaError, Result};

/// Decodes raw bus messages into CDC records.
///
/// The wire format is owned by the upstream CDC source; implementations
/// live at the application edge. Returning `Ok(None)` skips the message
/// (tombstones and heartbeats).
pub trait RecordDecoder: Send + Sync {
    fn decode(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<Option<CdcRecord>>;
}

/// One assigned (topic, partition) and its record stream.
pub struct Claim {
    pub topic: String,
    pub partition: i32,
    pub records: mpsc::Receiver<CdcRecord>,
}

/// Handle onto a live consumer group session.
#[async_trait]
pub trait GroupSession: Send + Sync {
    /// Cancellation context of this session. Cancelled on rebalance, on
    /// processor error, and on shutdown.
    fn context(&self) -> CancellationToken;

    /// Record `offset` as the next offset to consume on (topic, partition).
    /// Marks only advance; a mark below the current one is ignored.
    async fn mark_offset(&self, topic: &str, partition: i32, offset: i64);

    /// Synchronously commit all marked offsets.
    async fn commit(&self) -> Result<()>;
}

/// Receives claims for one session.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    /// Called once per session before any claim is delivered.
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<()>;

    /// Own one claim until it ends. An error cancels the whole session.
    async fn consume_claim(&self, session: Arc<dyn GroupSession>, claim: Claim) -> Result<()>;
}

/// A consumer group that can be asked to run one session over a topic set.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Run one session: block until rebalance, error, or cancellation.
    /// Rebalance is a normal return; the caller loops.
    async fn consume(&self, ctx: CancellationToken, topics: &[String]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Consumer context that ends the session when partitions are revoked.
struct SessionContext {
    token: CancellationToken,
}

impl ClientContext for SessionContext {}

impl ConsumerContext for SessionContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(_) = rebalance {
            debug!("partition revocation, ending session");
            self.token.cancel();
        }
    }
}

/// Session state shared with claim handlers.
struct KafkaGroupSession {
    consumer: Arc<StreamConsumer<SessionContext>>,
    token: CancellationToken,
    marked: Mutex<HashMap<(String, i32), i64>>,
}

impl KafkaGroupSession {
    fn marked_tpl(&self) -> Option<TopicPartitionList> {
        let marked = self.marked.lock().expect("offset map lock");
        if marked.is_empty() {
            return None;
        }
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in marked.iter() {
            let _ = tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset));
        }
        Some(tpl)
    }

    fn commit_marked(&self, mode: CommitMode) -> Result<()> {
        if let Some(tpl) = self.marked_tpl() {
            self.consumer
                .commit(&tpl, mode)
                .map_err(|e| KafkaError::Consume(format!("committing offsets: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl GroupSession for KafkaGroupSession {
    fn context(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn mark_offset(&self, topic: &str, partition: i32, offset: i64) {
        let mut marked = self.marked.lock().expect("offset map lock");
        let entry = marked.entry((topic.to_string(), partition)).or_insert(offset);
        if *entry < offset {
            *entry = offset;
        }
    }

    async fn commit(&self) -> Result<()> {
        self.commit_marked(CommitMode::Sync)
    }
}

/// Broker-backed consumer group running claim sessions over a
/// `StreamConsumer`.
pub struct KafkaConsumerGroup {
    brokers: String,
    group_id: String,
    handler: Arc<dyn ClaimHandler>,
    decoder: Arc<dyn RecordDecoder>,
    auto_commit: bool,
    commit_interval: Duration,
    claim_capacity: usize,
}

impl KafkaConsumerGroup {
    pub fn new(
        brokers: &str,
        group_id: &str,
        handler: Arc<dyn ClaimHandler>,
        decoder: Arc<dyn RecordDecoder>,
        auto_commit: bool,
    ) -> Self {
        Self {
            brokers: brokers.to_string(),
            group_id: group_id.to_string(),
            handler,
            decoder,
            auto_commit,
            commit_interval: Duration::from_secs(5),
            claim_capacity: 1024,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config.set("group.id", &self.group_id);
        // Offsets are committed from the session, never by the client.
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        config.set("auto.offset.reset", "earliest");
        config.set("session.timeout.ms", "30000");
        config
    }

    /// Route a record into its claim channel, opening the claim on first
    /// contact with the (topic, partition).
    async fn route(
        &self,
        record: CdcRecord,
        session: &Arc<KafkaGroupSession>,
        claims: &mut HashMap<(String, i32), mpsc::Sender<CdcRecord>>,
        tasks: &mut JoinSet<Result<()>>,
    ) {
        let key = (record.topic.clone(), record.partition);
        let sender = claims.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.claim_capacity);
            let claim = Claim {
                topic: key.0.clone(),
                partition: key.1,
                records: rx,
            };
            info!(topic = %key.0, partition = key.1, "claim opened");
            let handler = Arc::clone(&self.handler);
            let session: Arc<dyn GroupSession> = session.clone();
            tasks.spawn(async move { handler.consume_claim(session, claim).await });
            tx
        });
        // A closed receiver means the handler already returned; its
        // result is collected when the session joins its tasks.
        if sender.send(record).await.is_err() {
            claims.remove(&key);
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(&self, ctx: CancellationToken, topics: &[String]) -> Result<()> {
        let token = ctx.child_token();
        let consumer: StreamConsumer<SessionContext> = self
            .client_config()
            .create_with_context(SessionContext {
                token: token.clone(),
            })
            .map_err(|e| KafkaError::Consume(format!("creating consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| KafkaError::Consume(format!("subscribing: {e}")))?;

        let consumer = Arc::new(consumer);
        let session = Arc::new(KafkaGroupSession {
            consumer: Arc::clone(&consumer),
            token: token.clone(),
            marked: Mutex::new(HashMap::new()),
        });

        self.handler
            .setup(Arc::clone(&session) as Arc<dyn GroupSession>)
            .await?;

        let mut claims: HashMap<(String, i32), mpsc::Sender<CdcRecord>> = HashMap::new();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut commit_tick = tokio::time::interval(self.commit_interval);
        commit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Claim handlers cancel the session token on error, so the loop
        // only has to watch the token; handler results are collected at
        // teardown.
        let mut session_err: Option<KafkaError> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = commit_tick.tick(), if self.auto_commit => {
                    if let Err(e) = session.commit_marked(CommitMode::Async) {
                        warn!(error = %e, "async offset commit failed");
                    }
                }
                received = consumer.recv() => {
                    let decoded = match received {
                        Ok(msg) => {
                            let payload = msg.payload().unwrap_or(&[]);
                            if payload.is_empty() {
                                None
                            } else {
                                match self.decoder.decode(
                                    msg.topic(),
                                    msg.partition(),
                                    msg.offset(),
                                    msg.key(),
                                    payload,
                                ) {
                                    Ok(rec) => rec,
                                    Err(e) => {
                                        session_err = Some(e);
                                        token.cancel();
                                        None
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            session_err =
                                Some(KafkaError::Consume(format!("consumer receive: {e}")));
                            token.cancel();
                            None
                        }
                    };
                    if let Some(record) = decoded {
                        self.route(record, &session, &mut claims, &mut tasks).await;
                    }
                }
            }
        }

        // Close claim channels so handlers drain and return, then join.
        token.cancel();
        claims.clear();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "claim handler failed");
                    if session_err.is_none() && !matches!(e, KafkaError::SessionDone) {
                        session_err = Some(e);
                    }
                }
                Err(e) => {
                    if session_err.is_none() {
                        session_err = Some(KafkaError::Consume(format!("claim task: {e}")));
                    }
                }
            }
        }

        // Marked offsets are signal-complete by contract, so flushing them
        // on the way out never violates at-least-once.
        if let Err(e) = session.commit_marked(CommitMode::Sync) {
            warn!(error = %e, "final offset commit failed");
        }
        consumer.unsubscribe();

        match session_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
