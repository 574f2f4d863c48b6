//! In-process publish/subscribe broadcast bus (spec §4.2).
//!
//! Grounded on the control-plane's `broadcast::Sender<OrbitEvent>` fan-out:
//! one broadcast channel per job, subscribers attach by cloning a receiver.
//! `tokio::sync::broadcast` already implements the required backpressure
//! policy for us — a lagging subscriber silently drops the oldest queued
//! messages rather than blocking the publisher, which is exactly "drop
//! progress/log, never block" from spec §4.2. `complete`/`error` additionally
//! get a bounded retry-on-lag send so they are not dropped by that policy.

use crate::model::{ChunkStatus, JobError, LogEntry, PipelineStage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub stage: PipelineStage,
    pub overall_percent: u8,
    pub chunks: Option<Vec<ChunkStatus>>,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Progress(PipelineProgress),
    Log(LogEntry),
    Complete {
        output_file: std::path::PathBuf,
        total_elapsed_ms: u64,
    },
    Error(JobError),
    Heartbeat,
}

impl BusEvent {
    /// `complete`/`error` must never be dropped under backpressure (spec §4.2).
    fn must_deliver(&self) -> bool {
        matches!(self, BusEvent::Complete { .. } | BusEvent::Error(_))
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    job_id: String,
    bus: Arc<ProgressBus>,
    delivered_terminal: bool,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Await the next event. Returns `None` once the channel has closed (no
    /// more publishers, i.e. the job's bus entry was torn down) — a closed
    /// subscription yields no further events, satisfying the idempotent
    /// cancel contract.
    ///
    /// `complete`/`error` are replayed from the bus's last-terminal-event
    /// record whenever a lag (or close) would otherwise have caused this
    /// subscriber to miss them, since `tokio::sync::broadcast` evicts the
    /// oldest buffered message regardless of its kind.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(event) = self.take_terminal().await {
                        return Some(event);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return self.take_terminal().await,
            }
        }
    }

    async fn take_terminal(&mut self) -> Option<BusEvent> {
        if self.delivered_terminal {
            return None;
        }
        let event = self.bus.terminal_for(&self.job_id).await?;
        self.delivered_terminal = true;
        Some(event)
    }

    /// Idempotent: dropping (or calling this repeatedly) just releases the
    /// receiver end; no explicit bookkeeping is needed since each
    /// subscription owns an independent broadcast receiver.
    pub fn cancel(self) {}
}

#[derive(Default)]
pub struct ProgressBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusEvent>>>,
    /// Last `complete`/`error` published per job, kept outside the broadcast
    /// ring so a lagging or just-attached subscriber can still recover it
    /// even after the ring itself has evicted it.
    terminals: Mutex<HashMap<String, BusEvent>>,
}

impl ProgressBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn channel_for(&self, job_id: &str) -> broadcast::Sender<BusEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    async fn terminal_for(&self, job_id: &str) -> Option<BusEvent> {
        self.terminals.lock().await.get(job_id).cloned()
    }

    pub async fn subscribe(self: &Arc<Self>, job_id: &str) -> Subscription {
        let tx = self.channel_for(job_id).await;
        Subscription {
            rx: tx.subscribe(),
            job_id: job_id.to_string(),
            bus: self.clone(),
            delivered_terminal: false,
        }
    }

    /// Non-blocking publish. A full/laggy subscriber buffer only affects
    /// that subscriber (tokio's broadcast drops oldest-for-them); other
    /// subscribers and the publisher are unaffected. `complete`/`error` are
    /// additionally recorded in `terminals` so a lagged or late subscriber
    /// can still retrieve them via [`Subscription::next`]'s retry-on-lag.
    pub async fn publish(&self, job_id: &str, event: BusEvent) {
        if event.must_deliver() {
            self.terminals.lock().await.insert(job_id.to_string(), event.clone());
        }
        let tx = self.channel_for(job_id).await;
        let _ = tx.send(event);
    }

    /// Drops the channel for a job, closing every subscription for it.
    pub async fn teardown(&self, job_id: &str) {
        self.channels.lock().await.remove(job_id);
        self.terminals.lock().await.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("job-1").await;

        bus.publish(
            "job-1",
            BusEvent::Progress(PipelineProgress {
                stage: PipelineStage::Download,
                overall_percent: 5,
                chunks: None,
            }),
        )
        .await;
        bus.publish(
            "job-1",
            BusEvent::Progress(PipelineProgress {
                stage: PipelineStage::Chunk,
                overall_percent: 20,
                chunks: None,
            }),
        )
        .await;

        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        match (first, second) {
            (BusEvent::Progress(a), BusEvent::Progress(b)) => {
                assert_eq!(a.overall_percent, 5);
                assert_eq!(b.overall_percent, 20);
            }
            _ => panic!("unexpected event kinds"),
        }
    }

    #[tokio::test]
    async fn two_subscribers_see_same_order() {
        let bus = ProgressBus::new();
        let mut a = bus.subscribe("job-1").await;
        let mut b = bus.subscribe("job-1").await;

        bus.publish("job-1", BusEvent::Heartbeat).await;
        bus.publish(
            "job-1",
            BusEvent::Error(JobError {
                code: "CANCELLED".into(),
                message: "cancelled".into(),
                stage: crate::error::Stage::Dub,
                recoverable: false,
                failed_chunk_indices: None,
                details: None,
            }),
        )
        .await;

        assert!(matches!(a.next().await.unwrap(), BusEvent::Heartbeat));
        assert!(matches!(b.next().await.unwrap(), BusEvent::Heartbeat));
        assert!(matches!(a.next().await.unwrap(), BusEvent::Error(_)));
        assert!(matches!(b.next().await.unwrap(), BusEvent::Error(_)));
    }

    #[tokio::test]
    async fn closed_subscription_yields_none() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("job-1").await;
        bus.teardown("job-1").await;
        assert!(sub.next().await.is_none());
    }
}
