//! Datafeed execution platform worker process.
//!
//! Wires together the token store (C1), sandbox pool (C2), circuit
//! breaker registry (C3), tenant router (C4), sharded worker pools (C5),
//! job handler (C6), broker consumer (C7), rate-limited uploader (C8),
//! output dispatcher (C9) and DLQ consumer (C10) into one running
//! process, the way `apps/zerg/tasks-worker` wires its own stream
//! pipeline together.

mod config;
mod health;
mod ingest;
mod process_sandbox;

use std::sync::Arc;
use std::time::Duration;

use core_config::{app_info, Environment, FromEnv};
use database::redis::{connect_from_config_with_retry, RedisConfig};
use dispatch_core::{
    BrokerConsumer, BrokerConsumerConfig, CircuitBreakerConfig, CircuitBreakerRegistry, ContainerPool,
    ContainerPoolConfig, DlqConsumer, DlqConsumerConfig, DlqWriter, HttpIngestionClient, JobHandler, OutputDispatcher,
    OutputDispatcherConfig, RateLimitedUploader, RedisStreamsBroker, RedisStreamsBrokerConfig, TenantRouter,
    TokenStore, UploaderConfig, WorkerPool, WorkerPoolConfig,
};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use config::WorkerSettings;
use process_sandbox::ProcessSandboxFactory;

pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, ?environment, "starting datafeed worker");

    let settings = WorkerSettings::from_env().wrap_err("failed to load worker configuration")?;

    let health_port: u16 = std::env::var("DATAFEED_WORKER_HEALTH_PORT")
        .or_else(|_| std::env::var("HEALTH_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let redis_config = RedisConfig::from_env().wrap_err("failed to load redis configuration")?;
    info!("connecting to redis...");
    let redis = connect_from_config_with_retry(redis_config, None)
        .await
        .wrap_err("failed to connect to redis")?;
    info!("connected to redis");

    let token_store = Arc::new(TokenStore::new());

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));

    let container_pool = Arc::new(
        ContainerPool::initialize(
            Box::new(ProcessSandboxFactory::new(settings.image.clone())),
            ContainerPoolConfig {
                min: settings.minimum_containers,
                max: settings.maximum_containers,
                idle_timeout: settings.container_idle_timeout,
                ..ContainerPoolConfig::default()
            },
        )
        .await
        .wrap_err("failed to initialize sandbox pool")?,
    );

    let (router, shard_queues) = TenantRouter::new(settings.number_of_shards, 256, Arc::clone(&breakers));
    let router = Arc::new(router);

    let job_handler = Arc::new(JobHandler::new());

    let (output_tx, output_rx) = tokio::sync::mpsc::channel(1024);
    let (state_tx, mut state_rx) = tokio::sync::mpsc::channel(1024);
    let worker_pool = Arc::new(WorkerPool::new(
        shard_queues,
        WorkerPoolConfig {
            workers_per_shard: settings.workers_per_shard,
            ..WorkerPoolConfig::default()
        },
        Arc::clone(&container_pool),
        Arc::clone(&token_store),
        Arc::clone(&breakers),
        Arc::clone(&job_handler),
        output_tx,
        state_tx,
    ));

    let ingestion_client = Arc::new(
        HttpIngestionClient::new(
            settings.soar_api_base_url.clone(),
            settings.soar_api_api_key.clone(),
            Duration::from_secs(30),
        )
        .wrap_err("failed to build ingestion http client")?,
    );
    let uploader = Arc::new(RateLimitedUploader::new(
        ingestion_client,
        settings.soar_api_rate_limit,
        settings.soar_api_burst_limit,
        UploaderConfig {
            max_retries: settings.soar_api_max_retries,
            retry_interval: settings.soar_api_retry_interval,
        },
    ));

    let (batch_tx, mut batch_rx) = tokio::sync::mpsc::channel(64);
    let dispatcher = OutputDispatcher::new(OutputDispatcherConfig::default(), output_rx, batch_tx);

    let broker = Arc::new(
        RedisStreamsBroker::new(
            redis,
            RedisStreamsBrokerConfig {
                input_stream: "datafeed:alerts".to_string(),
                state_stream: settings.kafka_topic_job_state.clone(),
                dlq_stream: settings.kafka_topic_alert_dlq.clone(),
                consumer_group: "datafeed-workers".to_string(),
                consumer_id: uuid::Uuid::new_v4().to_string(),
                dlq_consumer_group: "datafeed-dlq-workers".to_string(),
                dlq_consumer_id: uuid::Uuid::new_v4().to_string(),
                dlq_max_length: 100_000,
            },
        )
        .await
        .wrap_err("failed to initialize broker")?,
    );

    let dlq_writer = DlqWriter::new(broker.clone());

    let state_publisher_handle = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            while let Some(payload) = state_rx.recv().await {
                if let Err(e) = broker.publish_state(&payload).await {
                    warn!(error = %e, "failed to publish job state change");
                }
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = health::HealthState::new(app_info.name, app_info.version, prometheus);
    let ingest_state = ingest::IngestState::new(Arc::clone(&router));
    let http_app = health::router(health_state)
        .merge(ingest::router(ingest_state))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        );
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{health_port}");
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!(port = health_port, "health and ingest server listening");
                if let Err(e) = axum::serve(listener, http_app).await {
                    error!(error = %e, "health server failed");
                }
            }
            Err(e) => error!(error = %e, addr, "failed to bind health server"),
        }
    });

    let broker_consumer = Arc::new(BrokerConsumer::new(
        broker.clone(),
        BrokerConsumerConfig {
            batch_size: settings.kafka_batch_size,
            read_timeout: settings.kafka_message_read_timeout,
            ..BrokerConsumerConfig::default()
        },
        Arc::clone(&uploader),
    ));
    let consumer_handle = {
        let consumer = Arc::clone(&broker_consumer);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };

    let dlq_consumer = Arc::new(DlqConsumer::new(broker.clone(), DlqConsumerConfig::default(), Arc::clone(&uploader)));
    let dlq_handle = {
        let consumer = Arc::clone(&dlq_consumer);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };

    let dispatcher_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(shutdown_rx).await })
    };

    let upload_sink_handle = {
        let uploader = Arc::clone(&uploader);
        tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                let result = uploader.upload(&batch).await;
                for failure in result.failed {
                    let failed = dispatch_core::FailedRecord::new(
                        failure.output.alert.clone(),
                        failure.output.tenant.clone(),
                        failure.error.clone(),
                        failure.output.job_id.clone(),
                        failure.output.datafeed_id.clone(),
                    );
                    if let Err(e) = dlq_writer.push(&failed).await {
                        warn!(error = %e, "failed to route failed upload to dlq");
                    }
                }
            }
        })
    };

    let worker_handles = Arc::clone(&worker_pool).spawn(shutdown_rx.clone());
    let eviction_handle = Arc::clone(&container_pool).spawn_eviction_ticker(shutdown_rx.clone());

    // Shutdown in spec order: broker consumer -> dispatcher/uploader drain
    // -> worker pools -> container pool -> close broker client.
    let _ = consumer_handle.await;
    let _ = dlq_handle.await;
    let _ = dispatcher_handle.await;
    let _ = upload_sink_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    drop(worker_pool); // drops the last `state_tx` sender, letting the publisher task drain and exit
    let _ = state_publisher_handle.await;
    container_pool.stop_all().await;
    let _ = eviction_handle.await;
    if let Err(e) = broker.close().await {
        warn!(error = %e, "error closing broker client");
    }

    info!("datafeed worker stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, initiating shutdown"),
        _ = terminate => info!("received sigterm, initiating shutdown"),
    }

    Ok(())
}
