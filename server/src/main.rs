#![allow(dead_code)]

mod analysis;
mod email;
mod error;
mod events;
mod mapping;
mod observability;
mod prompt;
mod queue;
mod rate_limiter;
mod server_config;
mod store;
#[cfg(test)]
mod testing;
mod util;
mod workflow;

use std::{env, sync::Arc, time::Duration};

use mimalloc::MiMalloc;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    analysis::worker::{AnalysisWorker, AnalysisWorkerConfig},
    email::{
        delivery::{EmailDelivery, SmtpDelivery},
        sender::{EmailSender, EmailSenderConfig},
    },
    events::{EventSource, JsonFileEventSource},
    mapping::{AccountMapping, JsonFileMapping, MappingSource},
    observability::WorkflowTracker,
    prompt::{AiClient, GenerationParams, HttpAiClient},
    queue::{InMemoryQueue, MessageQueue},
    rate_limiter::RateLimiter,
    server_config::cfg,
    store::InMemoryStore,
    workflow::{
        cleanup::cleanup_workflow,
        dispatcher::DispatcherConfig,
        CompletionCoordinator, CompletionStatus, NotificationDispatcher, WorkflowInitializer,
    },
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

#[derive(Clone)]
struct ServerState {
    store: Arc<InMemoryStore>,
    task_queue: Arc<dyn MessageQueue>,
    email_queue: Arc<dyn MessageQueue>,
    rate_limiter: RateLimiter,
    ai_client: Arc<dyn AiClient>,
    tracker: WorkflowTracker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    println!("{}", *cfg);

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;

    let store = Arc::new(InMemoryStore::new());
    let task_queue: Arc<dyn MessageQueue> =
        Arc::new(InMemoryQueue::new(cfg.queues.dedup_window_secs));
    let email_queue: Arc<dyn MessageQueue> =
        Arc::new(InMemoryQueue::new(cfg.queues.dedup_window_secs));
    let rate_limiter = RateLimiter::new(store.clone(), cfg.rate_limit);
    let ai_client: Arc<dyn AiClient> = Arc::new(HttpAiClient::new(http_client.clone(), &cfg.ai));
    let tracker = WorkflowTracker::new();

    let state = ServerState {
        store: store.clone(),
        task_queue: task_queue.clone(),
        email_queue: email_queue.clone(),
        rate_limiter: rate_limiter.clone(),
        ai_client: ai_client.clone(),
        tracker: tracker.clone(),
    };

    let shutdown = CancellationToken::new();

    // Analysis worker
    let worker = AnalysisWorker::new(
        task_queue.clone(),
        store.clone(),
        rate_limiter.clone(),
        ai_client.clone(),
        GenerationParams::from(&cfg.ai),
        tracker.clone(),
        AnalysisWorkerConfig {
            max_retries: cfg.workflow.max_retries,
            ttl_days: cfg.workflow.ttl_days,
            call_max_attempts: cfg.ai.call_max_attempts,
            skip_analysis: cfg.settings.skip_analysis,
            batch_size: cfg.queues.batch_size,
            poll_interval_ms: cfg.queues.poll_interval_ms,
        },
    );
    let worker_shutdown = shutdown.clone();
    tokio::spawn(async move {
        worker.run(worker_shutdown).await;
    });

    // Email sender
    let delivery: Arc<dyn EmailDelivery> = Arc::new(SmtpDelivery::new(&cfg.email.smtp_host)?);
    let sender = EmailSender::new(
        email_queue.clone(),
        store.clone(),
        delivery,
        tracker.clone(),
        EmailSenderConfig {
            max_retries: cfg.workflow.max_retries,
            ttl_days: cfg.workflow.ttl_days,
            batch_size: cfg.queues.batch_size,
            poll_interval_ms: cfg.queues.poll_interval_ms,
            from: cfg.email.from.clone(),
            account_cc: cfg.email.account_cc.clone(),
            customer_name: cfg.settings.customer_name.clone(),
            master_report_only: cfg.settings.master_report_only,
        },
    );
    let sender_shutdown = shutdown.clone();
    tokio::spawn(async move {
        sender.run(sender_shutdown).await;
    });

    let mut scheduler = JobScheduler::new()
        .await
        .expect("Failed to create scheduler");

    {
        // Periodic analysis workflow
        let state_clone = state.clone();
        scheduler
            .add(Job::new_async(
                cfg.workflow.schedule.as_str(),
                move |uuid, mut l| {
                    let state = state_clone.clone();
                    Box::pin(async move {
                        tracing::info!("Running scheduled analysis workflow (job {})", uuid);
                        match run_workflow(state).await {
                            Ok(_) => {
                                tracing::info!("Workflow job {} finished", uuid);
                            }
                            Err(e) => {
                                tracing::error!("Workflow job {} failed: {:?}", uuid, e);
                            }
                        }

                        let next_tick = l.next_tick_for_job(uuid).await;
                        if let Ok(Some(ts)) = next_tick {
                            tracing::info!("Next workflow run at {:?}", ts)
                        }
                    })
                },
            )?)
            .await?;

        // Optional immediate run on startup
        if env::var("RUN_ON_START").is_ok_and(|v| v == "true") {
            let state_clone = state.clone();
            scheduler
                .add(Job::new_one_shot_async(
                    Duration::from_secs(2),
                    move |_uuid, _l| {
                        let state = state_clone.clone();
                        Box::pin(async move {
                            if let Err(e) = run_workflow(state).await {
                                tracing::error!("Startup workflow failed: {:?}", e);
                            }
                        })
                    },
                )?)
                .await?;
        }

        // Every 60 seconds, log pipeline status
        let tracker_clone = tracker.clone();
        let limiter_clone = rate_limiter.clone();
        scheduler
            .add(Job::new_repeated_async(
                Duration::from_secs(60),
                move |_uuid, _l| {
                    let tracker = tracker_clone.clone();
                    let limiter = limiter_clone.clone();
                    Box::pin(async move {
                        tracing::info!(
                            "Pipeline status: {} | limiter: {}",
                            tracker.status_line(),
                            limiter.status().await
                        );
                    })
                },
            )?)
            .await?;

        // Every 30 minutes, prune expired store rows
        let store_clone = store.clone();
        scheduler
            .add(Job::new_repeated(
                Duration::from_secs(30 * 60),
                move |_uuid, _l| {
                    let removed = store_clone.prune_expired();
                    if removed > 0 {
                        tracing::info!("Pruned {} expired store rows", removed);
                    }
                },
            )?)
            .await?;
    }

    scheduler.set_shutdown_handler(Box::new(move || {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));

    println!("Starting scheduler...");
    match scheduler.start().await {
        Ok(_) => {
            println!("-------- HEALTHWATCH STARTED --------");
        }
        Err(e) => {
            println!("Failed to start scheduler: {:?}", e);
        }
    }

    shutdown_signal(scheduler).await;
    shutdown.cancel();

    // Let the workers drain their current batch.
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("Cleanups done, shutting down");

    Ok(())
}

/// One end-to-end run: load events, fan out, poll to completion,
/// dispatch, clean up.
async fn run_workflow(state: ServerState) -> anyhow::Result<()> {
    let Some(events_file) = cfg.settings.events_file.as_ref() else {
        tracing::warn!("No events_file configured, skipping workflow run");
        return Ok(());
    };

    let source = JsonFileEventSource::new(events_file.clone());
    let events = source.fetch().await?;
    if events.is_empty() {
        tracing::info!("No health events found, nothing to analyze");
        return Ok(());
    }

    let organization = cfg
        .mapping
        .use_organization
        .then(|| cfg.mapping.organization_file.clone())
        .flatten()
        .map(JsonFileMapping::new);
    let custom = cfg
        .mapping
        .use_custom
        .then(|| cfg.mapping.custom_file.clone())
        .flatten()
        .map(JsonFileMapping::new);
    let mapping = AccountMapping::load(
        organization.as_ref().map(|m| m as &dyn MappingSource),
        custom.as_ref().map(|m| m as &dyn MappingSource),
    )
    .await;

    let initializer = WorkflowInitializer::new(
        state.task_queue.clone(),
        cfg.settings.excluded_services.clone(),
    );
    let run = initializer.initialize(events, &mapping).await?;

    if run.total_accounts == 0 {
        tracing::info!(
            "Workflow {} has no attributable accounts, complete without dispatch",
            run.workflow_id
        );
        return Ok(());
    }

    let dispatcher = NotificationDispatcher::new(
        state.email_queue.clone(),
        state.store.clone(),
        state.tracker.clone(),
        DispatcherConfig {
            default_recipients: cfg.email.default_recipients.clone(),
            master_report_only: cfg.settings.master_report_only,
            ttl_days: cfg.workflow.ttl_days,
        },
    );
    let coordinator =
        CompletionCoordinator::new(state.store.clone(), dispatcher, state.tracker.clone());

    let status = coordinator
        .poll_until_dispatched(
            &run,
            cfg.workflow.completion_poll_interval_secs,
            cfg.workflow.completion_poll_max_attempts,
        )
        .await?;

    match status {
        CompletionStatus::Dispatched { queued } => {
            tracing::info!(
                "Workflow {} dispatched {} notification message(s)",
                run.workflow_id,
                queued
            );
            if cfg.workflow.cleanup_after_dispatch {
                cleanup_workflow(state.store.as_ref(), &run.workflow_id).await;
            }
        }
        CompletionStatus::AlreadyDispatched => {
            tracing::info!("Workflow {} was already dispatched", run.workflow_id);
        }
        CompletionStatus::NotReady { completed, total } => {
            tracing::error!(
                "Workflow {} incomplete after poll budget: {}/{} accounts",
                run.workflow_id,
                completed,
                total
            );
        }
    }

    Ok(())
}

async fn shutdown_signal(mut scheduler: JobScheduler) {
    if env::var("NO_SHUTDOWN").unwrap_or("false".to_string()) == "true" {
        std::future::pending::<()>().await;
    }

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
        _ = ctrl_c => {
            scheduler.shutdown().await.unwrap();
        },
        _ = terminate => {
            scheduler.shutdown().await.unwrap();
        },
    }
}
