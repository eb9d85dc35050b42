mod collaborators;
mod config;

use collaborators::{DistressScoreRunner, LogAlertNotifier, LogDetectionStore};
use common::nats::NatsClient;
use common::telemetry::init_telemetry;
use config::ServiceConfig;
use herdwatch_runner::Runner;
use ingest_worker::batch_queue::BatchPolicy;
use ingest_worker::ingest_worker::{IngestWorker, IngestWorkerConfig};
use ingest_worker::ingress::SubjectMap;
use ingest_worker::pool::ExecutionPoolConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&config.log_level) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    let worker_id = if config.worker_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.worker_id.clone()
    };

    info!(
        worker_id = %worker_id,
        replica_quorum = config.replica_quorum,
        "Starting herdwatch worker"
    );
    debug!("Configuration: {:?}", config);

    let nats_client = match NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.nats_connect_timeout_secs),
    )
    .await
    {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to connect to NATS: {}", e);
            std::process::exit(1);
        }
    };

    let inference_runner = Arc::new(DistressScoreRunner {
        significance_floor: 0.5,
        alert_threshold: config.alert_threshold,
    });

    let worker_config = IngestWorkerConfig {
        subjects: SubjectMap {
            audio: config.audio_subject.clone(),
            accelerometer: config.accelerometer_subject.clone(),
            camera: config.camera_subject.clone(),
        },
        batch_policy: BatchPolicy {
            audio_threshold: config.audio_batch_threshold,
            accelerometer_threshold: config.accelerometer_batch_threshold,
            camera_threshold: config.camera_batch_threshold,
            flush_timeout: Duration::from_secs(config.batch_timeout_secs),
        },
        dispatch_period: Duration::from_millis(config.dispatch_period_ms),
        pool: ExecutionPoolConfig {
            workers: config.pool_workers,
            task_timeout: Duration::from_secs(config.task_timeout_secs),
        },
        worker_id,
        replica_quorum: config.replica_quorum,
        announce_subject: config.announce_subject.clone(),
        bid_subject: config.bid_subject.clone(),
        auction_expiry: Duration::from_secs(config.auction_expiry_secs),
    };

    let ingest_worker = match IngestWorker::new(
        nats_client.clone(),
        inference_runner,
        Arc::new(LogDetectionStore),
        Arc::new(LogAlertNotifier),
        worker_config,
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to initialize ingest worker: {}", e);
            std::process::exit(1);
        }
    };

    Runner::new()
        .with_app_processes(ingest_worker.into_runner_processes())
        .with_closer(move || async move {
            match Arc::try_unwrap(nats_client) {
                Ok(client) => client.close().await,
                Err(_) => debug!("NATS client still shared at shutdown"),
            }
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;
}
