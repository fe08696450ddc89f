use anyhow::Result;
use std::env;
use std::sync::Arc;
use tldw::{
    chain::{
        AnswerChain, ChainDeps, ChainRunner, SummarizeChain, TokenUsage, API_RESPONSE_QUEUE,
        PRIVATE_MESSAGE_QUEUE, PUBLIC_REPLY_QUEUE,
    },
    config::Config,
    content::FixtureMetadataProvider,
    delivery::{DeliveryWorker, TracingDeliverySink},
    dispatch::{load_trigger_dir, Dispatcher},
    llm::{FixtureLlm, LlmBackend},
    metrics::create_metrics_publisher,
    queue::QueueBroker,
    router::BackendRouter,
    speech::{FixtureSpeech, SpeechBackend},
    storage::{ResultCache, TaskLedger},
    supervisor::spawn_supervised_task,
    worker::BlockingPool,
};
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

/// Stand-in reply for backends with no fixture file. Shaped so both
/// pipelines can parse it.
const CANNED_REPLY: &str = r#"{"summary": "Canned fixture output. Add a reply fixture file for this backend to control it.", "answer": "Canned fixture output. Add a reply fixture file for this backend to control it.", "score": "50", "thinking": "", "if_no_need_summary": false}"#;

#[tokio::main]
async fn main() -> Result<()> {
    let version = tldw::config::version();

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    let config = Config::new()?;

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tldw=info".into()),
    );

    // Configure output format based on environment
    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!(version = %version, "Starting tldw service");

    let metrics = create_metrics_publisher(
        &config.metrics.adapter,
        config.metrics.statsd_host.as_deref(),
        &config.metrics.prefix,
        &config.metrics.statsd_bind,
        config.metrics.default_tags.as_deref(),
    )?;

    // Durable state: the per-task ledger, the result cache, and the queue
    // snapshot from the previous shutdown.
    let ledger = Arc::new(TaskLedger::load(config.ledger_path()).await?);
    let cache = Arc::new(ResultCache::load(config.cache_path()).await?);
    let broker = Arc::new(QueueBroker::new(config.queue_snapshot_path()));
    broker.recover().await?;

    let pool = Arc::new(BlockingPool::new(config.blocking_pool_size));

    let metadata_dir = config.metadata_fixture_dir();
    let metadata = if metadata_dir.is_dir() {
        Arc::new(FixtureMetadataProvider::from_dir(&metadata_dir).await?)
    } else {
        tracing::warn!(
            dir = %metadata_dir.display(),
            "No metadata fixture directory; every lookup will miss"
        );
        Arc::new(FixtureMetadataProvider::with_items(Vec::new()))
    };

    let llm_router = Arc::new(BackendRouter::new(config.llm_backends.clone()));
    for alias in config.llm_backends.keys() {
        let path = config.llm_fixture_path(alias);
        let backend: Arc<dyn LlmBackend> = if path.is_file() {
            Arc::new(FixtureLlm::from_file(alias.clone(), &path).await?)
        } else {
            tracing::warn!(
                backend = %alias,
                file = %path.display(),
                "No reply fixture file; backend will repeat a canned reply"
            );
            Arc::new(FixtureLlm::repeating(alias.clone(), CANNED_REPLY, 0))
        };
        if let Err(e) = llm_router.register(backend).await {
            tracing::error!(backend = %alias, error = ?e, "LLM backend registration failed");
        }
    }

    let speech_router = Arc::new(BackendRouter::new(config.speech_backends.clone()));
    for alias in config.speech_backends.keys() {
        let path = config.speech_fixture_path(alias);
        if !path.is_file() {
            tracing::warn!(
                backend = %alias,
                file = %path.display(),
                "No transcript fixture file; backend skipped"
            );
            continue;
        }
        let backend: Arc<dyn SpeechBackend> =
            Arc::new(FixtureSpeech::from_file(alias.clone(), pool.clone(), &path).await?);
        if let Err(e) = speech_router.register(backend).await {
            tracing::error!(backend = %alias, error = ?e, "Speech backend registration failed");
        }
    }

    let deps = Arc::new(ChainDeps {
        ledger,
        cache,
        broker: broker.clone(),
        metadata,
        llm: llm_router,
        speech: speech_router,
        metrics: metrics.clone(),
        tokens: Arc::new(TokenUsage::new(config.token_ceiling)),
        touch_up_transcripts: config.touch_up_transcripts,
    });

    // Create task tracker and cancellation token first
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let summarize = Arc::new(ChainRunner::new(
        Arc::new(SummarizeChain::new()),
        deps.clone(),
    ));
    spawn_supervised_task(
        &tracker,
        token.clone(),
        "chain-summarize",
        config.restart_backoff,
        move |cancel_token| {
            let runner = summarize.clone();
            async move { runner.run(cancel_token).await.map_err(anyhow::Error::from) }
        },
    );

    let answer = Arc::new(ChainRunner::new(Arc::new(AnswerChain::new()), deps.clone()));
    spawn_supervised_task(
        &tracker,
        token.clone(),
        "chain-answer",
        config.restart_backoff,
        move |cancel_token| {
            let runner = answer.clone();
            async move { runner.run(cancel_token).await.map_err(anyhow::Error::from) }
        },
    );

    for (task_name, queue_name) in [
        ("delivery-public-reply", PUBLIC_REPLY_QUEUE),
        ("delivery-private-message", PRIVATE_MESSAGE_QUEUE),
        ("delivery-api-response", API_RESPONSE_QUEUE),
    ] {
        let worker = Arc::new(DeliveryWorker::new(
            broker.get_or_create(queue_name).await,
            Arc::new(TracingDeliverySink::new(queue_name)),
            metrics.clone(),
        ));
        spawn_supervised_task(
            &tracker,
            token.clone(),
            task_name,
            config.restart_backoff,
            move |cancel_token| {
                let worker = worker.clone();
                async move { worker.run(cancel_token).await.map_err(anyhow::Error::from) }
            },
        );
    }

    // Feed queued work from the trigger fixture directory, if one exists.
    // A real deployment replaces this with a platform webhook listener.
    let dispatcher = Dispatcher::new(
        broker.clone(),
        config.summarize_keywords.clone(),
        config.answer_keywords.clone(),
        metrics.clone(),
    );
    let trigger_dir = config.trigger_fixture_dir();
    if trigger_dir.is_dir() {
        let triggers = load_trigger_dir(&trigger_dir).await?;
        tracing::info!(count = triggers.len(), "Dispatching fixture triggers");
        for trigger in triggers {
            if let Err(e) = dispatcher.dispatch(trigger).await {
                tracing::error!(error = ?e, "Trigger dispatch failed");
            }
        }
    }

    // Setup signal handler
    {
        let signal_tracker = tracker.clone();
        let signal_token = token.clone();

        tracing::info!("Starting signal handler task");
        tokio::spawn(async move {
            let ctrl_c = async {
                signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
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
                () = signal_token.cancelled() => {
                    tracing::info!("Signal handler task shutting down gracefully");
                },
                _ = terminate => {
                    tracing::info!("Received SIGTERM signal, initiating shutdown");
                },
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C signal, initiating shutdown");
                },
            }

            signal_tracker.close();
            signal_token.cancel();
            tracing::info!("Signal handler task completed");
        });
    }

    // Wait for all tasks to complete
    tracing::info!("Waiting for all tasks to complete...");
    tracker.wait().await;

    // Runners fold in-flight items back before exiting, so the snapshot
    // written here is complete.
    if let Err(e) = broker.safe_close_all().await {
        tracing::error!(error = ?e, "Queue snapshot write failed");
    }

    tracing::info!("All tasks completed, application shutting down");

    Ok(())
}
