use crate::dispatch::BatchSubmitter;
use crate::pool::LoadProbe;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use common::domain::{Bid, DomainError, DomainResult, JobAnnouncement, SensorBatch};
use common::nats::BusPublisher;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SWEEP_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AuctionConfig {
    pub worker_id: String,
    /// Number of bids required before an auction can resolve, equal to the
    /// number of redundant replicas in the deployment.
    pub required_quorum: usize,
    /// How long an auction may wait for quorum before the job is dropped.
    pub expiry: Duration,
    pub bid_subject: String,
}

struct AuctionState {
    /// The announcement may trail other replicas' bids on the wire, so it
    /// is attached to the state whenever it arrives.
    announcement: Option<JobAnnouncement>,
    bids: Vec<Bid>,
    opened_at: Instant,
}

impl AuctionState {
    fn new() -> Self {
        Self {
            announcement: None,
            bids: Vec::new(),
            opened_at: Instant::now(),
        }
    }
}

/// Decides, together with every other replica, which single replica
/// executes an announced job.
///
/// Every replica sees the same bid set and applies the same deterministic
/// selection, so no coordinator is needed: the winner recognizes itself and
/// submits the job locally; everyone else discards it. Auctions are
/// independent per job id, so one stuck auction cannot block another, and
/// state is deleted the moment an auction resolves or expires.
pub struct AuctionCoordinator {
    config: AuctionConfig,
    load: Arc<dyn LoadProbe>,
    publisher: Arc<dyn BusPublisher>,
    executor: Arc<dyn BatchSubmitter>,
    auctions: Mutex<HashMap<String, AuctionState>>,
}

impl AuctionCoordinator {
    pub fn new(
        config: AuctionConfig,
        load: Arc<dyn LoadProbe>,
        publisher: Arc<dyn BusPublisher>,
        executor: Arc<dyn BatchSubmitter>,
    ) -> Self {
        info!(
            worker_id = %config.worker_id,
            required_quorum = config.required_quorum,
            "Initializing auction coordinator"
        );
        Self {
            config,
            load,
            publisher,
            executor,
            auctions: Mutex::new(HashMap::new()),
        }
    }

    /// Bid on a newly announced job and remember its descriptor in case
    /// this replica wins.
    pub async fn handle_announcement(&self, announcement: JobAnnouncement) -> DomainResult<()> {
        let job_id = announcement.job_id.clone();
        let score = self.load.score();
        debug!(job_id = %job_id, score, "bidding on announced job");

        {
            let mut auctions = self.auctions.lock().expect("auction lock poisoned");
            let state = auctions.entry(job_id.clone()).or_insert_with(AuctionState::new);
            state.announcement = Some(announcement);
        }

        let bid = Bid {
            job_id,
            worker_id: self.config.worker_id.clone(),
            score,
        };
        let payload = serde_json::to_vec(&bid).context("failed to encode bid")?;
        self.publisher
            .publish(self.config.bid_subject.clone(), Bytes::from(payload))
            .await
            .map_err(DomainError::PublishError)?;
        Ok(())
    }

    /// Accumulate one bid; resolve the auction once quorum is reached.
    ///
    /// Resolution happens exactly once: the auction's state is removed in
    /// the same critical section that detects quorum, so a late or
    /// duplicate bid finds nothing to re-trigger.
    pub async fn handle_bid(&self, bid: Bid) -> DomainResult<()> {
        if !bid.score.is_finite() {
            return Err(DomainError::MalformedBid(format!(
                "non-finite score from worker {}",
                bid.worker_id
            )));
        }

        let job_id = bid.job_id.clone();
        let resolved = {
            let mut auctions = self.auctions.lock().expect("auction lock poisoned");
            let state = auctions.entry(job_id.clone()).or_insert_with(AuctionState::new);
            if state.bids.iter().any(|b| b.worker_id == bid.worker_id) {
                debug!(job_id = %job_id, worker_id = %bid.worker_id, "duplicate bid ignored");
                None
            } else {
                state.bids.push(bid);
                if state.bids.len() >= self.config.required_quorum {
                    let state = auctions
                        .remove(&job_id)
                        .expect("auction state present at resolution");
                    let winner = select_winner(&state.bids).clone();
                    Some((winner, state.announcement))
                } else {
                    None
                }
            }
        };

        if let Some((winner, announcement)) = resolved {
            self.finish(&job_id, winner, announcement).await;
        }
        Ok(())
    }

    async fn finish(&self, job_id: &str, winner: Bid, announcement: Option<JobAnnouncement>) {
        if winner.worker_id != self.config.worker_id {
            debug!(job_id, winner = %winner.worker_id, "lost auction, discarding job");
            return;
        }
        let Some(announcement) = announcement else {
            error!(job_id, "won an auction without having seen its announcement, job lost");
            return;
        };
        info!(job_id, score = winner.score, "won auction, executing job");
        if let Err(e) = self.executor.submit(announcement.into_batch()).await {
            error!(job_id, error = %e, "failed to submit won job for execution");
        }
    }

    /// Drop auctions that never reached quorum within the expiry window.
    /// The job is lost rather than risked being executed twice.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let mut auctions = self.auctions.lock().expect("auction lock poisoned");
        let before = auctions.len();
        auctions.retain(|job_id, state| {
            let keep = now.duration_since(state.opened_at) < self.config.expiry;
            if !keep {
                warn!(
                    job_id = %job_id,
                    bids = state.bids.len(),
                    required = self.config.required_quorum,
                    "auction expired before reaching quorum, job lost"
                );
            }
            keep
        });
        before - auctions.len()
    }

    /// Auctions currently awaiting quorum.
    pub fn open_auctions(&self) -> usize {
        self.auctions.lock().expect("auction lock poisoned").len()
    }

    /// Consume the announcement and bid subjects until cancelled, sweeping
    /// expired auctions at a fixed cadence. Malformed payloads are dropped
    /// with a log entry and never disturb other auctions.
    pub async fn run(
        self: Arc<Self>,
        mut announcements: async_nats::Subscriber,
        mut bids: async_nats::Subscriber,
        ctx: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("Starting auction coordinator loop");
        let mut sweep = tokio::time::interval(SWEEP_PERIOD);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Received shutdown signal, stopping auction coordinator");
                    break;
                }
                maybe = announcements.next() => {
                    let Some(msg) = maybe else {
                        warn!("announcement subscription closed, stopping auction coordinator");
                        break;
                    };
                    match serde_json::from_slice::<JobAnnouncement>(&msg.payload) {
                        Ok(announcement) => {
                            if let Err(e) = self.handle_announcement(announcement).await {
                                warn!(error = %e, "failed to bid on announced job");
                            }
                        }
                        Err(e) => warn!(error = %e, "malformed job announcement dropped"),
                    }
                }
                maybe = bids.next() => {
                    let Some(msg) = maybe else {
                        warn!("bid subscription closed, stopping auction coordinator");
                        break;
                    };
                    match serde_json::from_slice::<Bid>(&msg.payload) {
                        Ok(bid) => {
                            if let Err(e) = self.handle_bid(bid).await {
                                warn!(error = %e, "dropped bad bid");
                            }
                        }
                        Err(e) => warn!(error = %e, "malformed bid dropped"),
                    }
                }
                _ = sweep.tick() => {
                    self.expire_stale();
                }
            }
        }

        Ok(())
    }
}

/// Lowest score wins; ties break on worker id so every replica picks the
/// same winner from the same bid set.
fn select_winner(bids: &[Bid]) -> &Bid {
    bids.iter()
        .min_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        })
        .expect("resolved auction has at least one bid")
}

/// BatchSubmitter for distributed mode: broadcasts the batch as a job
/// announcement for auction instead of executing it locally.
pub struct JobAnnouncer {
    publisher: Arc<dyn BusPublisher>,
    announce_subject: String,
}

impl JobAnnouncer {
    pub fn new(publisher: Arc<dyn BusPublisher>, announce_subject: String) -> Self {
        Self {
            publisher,
            announce_subject,
        }
    }
}

#[async_trait]
impl BatchSubmitter for JobAnnouncer {
    async fn submit(&self, batch: SensorBatch) -> DomainResult<()> {
        let announcement = JobAnnouncement::new(uuid::Uuid::new_v4().to_string(), batch);
        info!(
            job_id = %announcement.job_id,
            key = %announcement.batch.key(),
            batch_size = announcement.batch.len(),
            "announcing job for auction"
        );
        let payload =
            serde_json::to_vec(&announcement).context("failed to encode job announcement")?;
        self.publisher
            .publish(self.announce_subject.clone(), Bytes::from(payload))
            .await
            .map_err(DomainError::PublishError)?;
        Ok(())
    }
}
