//! Claim dispatch: wiring sessions to batch processors.
//!
//! For every (topic, partition) the session claims, the dispatcher spawns
//! a [`BatchProcessor`] task and feeds it pre-cut buffers: the claim's
//! record stream is chopped by size (`max_size` records) and by time
//! (`max_wait`), whichever trips first. Processor errors cancel the
//! session so the group rebalances and resumes from committed offsets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lakesink_core::CdcRecord;
use lakesink_kafka::{Claim, ClaimHandler, GroupSession, KafkaError};

use crate::error::BatcherError;
use crate::processor::BatchProcessorFactory;

/// Buffers queued between the dispatcher and one processor.
const BUFFER_CHANNEL_CAPACITY: usize = 16;

pub struct ClaimDispatcher {
    factory: Arc<BatchProcessorFactory>,
    max_size: usize,
    max_wait: Duration,
    ready: watch::Sender<bool>,
}

impl ClaimDispatcher {
    /// Returns the dispatcher and a receiver that flips to `true` once
    /// the first session reaches setup.
    pub fn new(
        factory: Arc<BatchProcessorFactory>,
        max_size: usize,
        max_wait: Duration,
    ) -> (Self, watch::Receiver<bool>) {
        let (ready, ready_rx) = watch::channel(false);
        (
            Self {
                factory,
                max_size: max_size.max(1),
                max_wait,
                ready,
            },
            ready_rx,
        )
    }
}

/// Hand a cut buffer to the processor, racing session cancellation.
/// Returns false when the session died or the processor is gone.
async fn send_buffer(
    token: &CancellationToken,
    tx: &mpsc::Sender<Vec<CdcRecord>>,
    pending: &mut Vec<CdcRecord>,
) -> bool {
    let buffer = std::mem::take(pending);
    tokio::select! {
        _ = token.cancelled() => false,
        sent = tx.send(buffer) => sent.is_ok(),
    }
}

#[async_trait]
impl ClaimHandler for ClaimDispatcher {
    async fn setup(&self, _session: Arc<dyn GroupSession>) -> lakesink_kafka::Result<()> {
        let _ = self.ready.send(true);
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: Claim,
    ) -> lakesink_kafka::Result<()> {
        let processor = match self.factory.make(&claim.topic, claim.partition).await {
            Ok(processor) => processor,
            Err(e) => {
                // No processor means no progress on this claim; end the
                // session rather than silently dropping its records.
                session.context().cancel();
                return Err(KafkaError::Consume(format!("building processor: {e}")));
            }
        };
        info!(topic = %claim.topic, partition = claim.partition, "claim processor ready");

        let token = session.context();
        let (buf_tx, buf_rx) = mpsc::channel(BUFFER_CHANNEL_CAPACITY);
        let (err_tx, mut err_rx) = mpsc::channel::<BatcherError>(1);
        let handle = tokio::spawn(Arc::new(processor).process(Arc::clone(&session), buf_rx, err_tx));

        let mut pending: Vec<CdcRecord> = Vec::with_capacity(self.max_size);
        let mut cut = tokio::time::interval_at(
            tokio::time::Instant::now() + self.max_wait,
            self.max_wait,
        );
        cut.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut claim_result: lakesink_kafka::Result<()> = Ok(());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(err) = err_rx.recv() => {
                    // The processor failed its round; end the whole session.
                    token.cancel();
                    claim_result = Err(KafkaError::Consume(err.to_string()));
                    break;
                }
                received = claim.records.recv() => match received {
                    Some(record) => {
                        pending.push(record);
                        if pending.len() >= self.max_size
                            && !send_buffer(&token, &buf_tx, &mut pending).await
                        {
                            break;
                        }
                    }
                    None => {
                        debug!(topic = %claim.topic, "claim ended");
                        break;
                    }
                },
                _ = cut.tick() => {
                    if !pending.is_empty()
                        && !send_buffer(&token, &buf_tx, &mut pending).await
                    {
                        break;
                    }
                }
            }
        }

        if claim_result.is_ok() && !pending.is_empty() && !token.is_cancelled() {
            send_buffer(&token, &buf_tx, &mut pending).await;
        }
        // Closing the buffer channel lets the processor finish its last
        // round and return.
        drop(buf_tx);
        if let Err(e) = handle.await {
            warn!(topic = %claim.topic, error = %e, "processor task join failed");
        }
        if claim_result.is_ok() {
            if let Ok(err) = err_rx.try_recv() {
                token.cancel();
                claim_result = Err(KafkaError::Consume(err.to_string()));
            }
        }
        claim_result
    }
}
