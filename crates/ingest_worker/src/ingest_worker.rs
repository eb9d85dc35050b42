use crate::auction::{AuctionConfig, AuctionCoordinator, JobAnnouncer};
use crate::batch_queue::{BatchPolicy, WindowedBatchQueue};
use crate::dispatch::{BatchSubmitter, DispatchLoop};
use crate::ingress::{MessageIngress, SubjectMap};
use crate::pool::{ExecutionPool, ExecutionPoolConfig, PoolSubmitter};
use crate::reassembly::AudioReassembler;
use common::domain::{AlertNotifier, DetectionStore, InferenceRunner};
use common::nats::NatsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct IngestWorkerConfig {
    pub subjects: SubjectMap,
    pub batch_policy: BatchPolicy,
    pub dispatch_period: Duration,
    pub pool: ExecutionPoolConfig,
    pub worker_id: String,
    /// Number of redundant replicas. Above 1 the worker runs in distributed
    /// mode: dispatched batches are announced for auction instead of
    /// executed directly.
    pub replica_quorum: usize,
    pub announce_subject: String,
    pub bid_subject: String,
    pub auction_expiry: Duration,
}

/// Wires the ingestion-and-dispatch engine together and exposes its
/// long-running processes to the runner.
pub struct IngestWorker {
    ingress: Arc<MessageIngress>,
    sensor_subscribers: Vec<async_nats::Subscriber>,
    dispatch: DispatchLoop,
    auction: Option<AuctionProcess>,
}

struct AuctionProcess {
    coordinator: Arc<AuctionCoordinator>,
    announcements: async_nats::Subscriber,
    bids: async_nats::Subscriber,
}

impl IngestWorker {
    pub async fn new(
        nats_client: Arc<NatsClient>,
        inference_runner: Arc<dyn InferenceRunner>,
        detection_store: Arc<dyn DetectionStore>,
        alert_notifier: Arc<dyn AlertNotifier>,
        config: IngestWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!(worker_id = %config.worker_id, "Initializing ingest worker module");

        let queue = Arc::new(WindowedBatchQueue::new(config.batch_policy));
        let reassembler = Arc::new(AudioReassembler::new());
        let pool = ExecutionPool::new(
            inference_runner,
            detection_store,
            alert_notifier,
            config.pool,
        );

        let ingress = Arc::new(MessageIngress::new(
            config.subjects.clone(),
            reassembler,
            queue.clone(),
        ));
        let mut sensor_subscribers = Vec::new();
        for subject in config.subjects.subjects() {
            sensor_subscribers.push(nats_client.subscribe(subject).await?);
        }

        let pool_submitter: Arc<dyn BatchSubmitter> = Arc::new(PoolSubmitter::new(pool.clone()));
        let (submitter, auction) = if config.replica_quorum > 1 {
            info!(
                required_quorum = config.replica_quorum,
                "Distributed mode active, dispatched batches go to auction"
            );
            let publisher = nats_client.create_publisher();
            let announcer: Arc<dyn BatchSubmitter> = Arc::new(JobAnnouncer::new(
                publisher.clone(),
                config.announce_subject.clone(),
            ));
            let coordinator = Arc::new(AuctionCoordinator::new(
                AuctionConfig {
                    worker_id: config.worker_id.clone(),
                    required_quorum: config.replica_quorum,
                    expiry: config.auction_expiry,
                    bid_subject: config.bid_subject.clone(),
                },
                pool.load_probe(),
                publisher,
                pool_submitter,
            ));
            let announcements = nats_client.subscribe(&config.announce_subject).await?;
            let bids = nats_client.subscribe(&config.bid_subject).await?;
            (
                announcer,
                Some(AuctionProcess {
                    coordinator,
                    announcements,
                    bids,
                }),
            )
        } else {
            (pool_submitter, None)
        };

        let dispatch = DispatchLoop::new(queue, submitter, config.dispatch_period);

        info!("Ingest worker initialized");
        Ok(Self {
            ingress,
            sensor_subscribers,
            dispatch,
            auction,
        })
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_processes(
        self,
    ) -> Vec<
        Box<
            dyn FnOnce(
                    CancellationToken,
                ) -> std::pin::Pin<
                    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
                > + Send,
        >,
    > {
        let mut processes: Vec<
            Box<
                dyn FnOnce(
                        CancellationToken,
                    ) -> std::pin::Pin<
                        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
                    > + Send,
            >,
        > = vec![
            // Sensor ingress loop
            Box::new({
                let ingress = self.ingress;
                let subscribers = self.sensor_subscribers;
                move |ctx| Box::pin(async move { ingress.run(subscribers, ctx).await })
            }),
            // Periodic dispatch loop
            Box::new({
                let dispatch = self.dispatch;
                move |ctx| Box::pin(async move { dispatch.run(ctx).await })
            }),
        ];

        if let Some(auction) = self.auction {
            // Auction coordinator loop (distributed mode)
            processes.push(Box::new(move |ctx| {
                Box::pin(async move {
                    auction
                        .coordinator
                        .run(auction.announcements, auction.bids, ctx)
                        .await
                })
            }));
        }

        processes
    }
}
