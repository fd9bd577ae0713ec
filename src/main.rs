use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use rfq_intake::config::AppConfig;
use rfq_intake::conversation::{
    ConversationWorkflow, FetchNewItemsActivity, ParseThreadActivity, PollingWorkflow,
    RecordTriageActivity, SingleItemTriage, StrategyChain, TriageWorkflow, start_polling,
};
use rfq_intake::durable::WorkflowRuntime;
use rfq_intake::inbox::{CleanupScheduler, IngestionGuard, spawn_cleanup_scheduler};
use rfq_intake::pipeline::{
    Delivery, DeliveryReport, InboundHandler, RulesParser, spawn_consumer,
};
use rfq_intake::store::{Database, EventInboxRepository, LibSqlBackend};

/// Deliveries reported as `redeliver` are re-queued after this delay.
const REDELIVERY_DELAY: Duration = Duration::from_secs(2);

/// Attempts after which a delivery is dropped instead of re-queued.
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    eprintln!("📨 RFQ Intake v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    let db: Arc<dyn Database> = backend.clone();
    let inbox: Arc<dyn EventInboxRepository> = backend;
    eprintln!("   Database: {}", config.db_path.display());

    // Conversations live in memory; whatever they held before a restart is
    // handed back to the poller.
    let requeued = db.requeue_queued_messages().await?;
    if requeued > 0 {
        info!(count = requeued, "Returned queued messages to pending");
    }

    // ── Inbox cleanup ────────────────────────────────────────────────────
    inbox.setup_cleanup_infrastructure().await?;
    let cleanup = if config.cleanup.enabled {
        let scheduler = Arc::new(CleanupScheduler::new(Arc::clone(&inbox), config.cleanup.clone())?);
        eprintln!("   Inbox cleanup: enabled ({})", config.cleanup.schedule);
        Some(spawn_cleanup_scheduler(scheduler))
    } else {
        eprintln!("   Inbox cleanup: disabled");
        None
    };

    // ── Workflow runtime ─────────────────────────────────────────────────
    let parser = Arc::new(RulesParser::default_rules());
    let strategy = StrategyChain::new().with(Arc::new(SingleItemTriage));
    eprintln!("   Outcome strategies: {}", strategy.len());
    let runtime = WorkflowRuntime::builder()
        .workflow(Arc::new(ConversationWorkflow::new(
            config.conversation.clone(),
            Arc::new(strategy),
        )))
        .workflow(Arc::new(TriageWorkflow::default()))
        .workflow(Arc::new(PollingWorkflow::new(
            &config.polling,
            config.conversation.task_queue.clone(),
        )))
        .activity(Arc::new(ParseThreadActivity::new(Arc::clone(&db), parser)))
        .activity(Arc::new(RecordTriageActivity::new(Arc::clone(&db))))
        .activity(Arc::new(FetchNewItemsActivity::new(
            Arc::clone(&db),
            config.polling.batch_limit,
        )))
        .build();

    if config.polling.enabled {
        start_polling(&runtime, &config.polling).await?;
        eprintln!("   Poller: every {}s", config.polling.interval.as_secs());
    } else {
        eprintln!("   Poller: disabled");
    }

    // ── Broker consumer ──────────────────────────────────────────────────
    let handler = Arc::new(InboundHandler::new(
        IngestionGuard::new(inbox, config.inbox.clone()),
        Arc::clone(&db),
        Arc::clone(&runtime),
        config.conversation.task_queue.clone(),
    ));
    let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(256);
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let (mut consumer, consumer_shutdown) = spawn_consumer(handler, delivery_rx, report_tx);
    let replies = tokio::spawn(handle_reports(report_rx, delivery_tx.downgrade()));
    let reader = tokio::spawn(read_deliveries(delivery_tx));

    eprintln!("   Reading JSON-lines deliveries from stdin. Ctrl-C to exit.\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            consumer_shutdown.cancel();
            let _ = (&mut consumer).await;
        }
        _ = &mut consumer => info!("Input drained, shutting down"),
    }

    reader.abort();
    let _ = replies.await;
    runtime.shutdown();
    if let Some((handle, shutdown)) = cleanup {
        shutdown.cancel();
        let _ = handle.await;
    }

    Ok(())
}

/// Read deliveries from stdin, one JSON document per line.
///
/// A line is either a full `Delivery` or a bare event payload, which is
/// wrapped as a first delivery on the `stdin` topic.
async fn read_deliveries(tx: mpsc::Sender<Delivery>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let delivery = match serde_json::from_str::<Delivery>(&line) {
            Ok(delivery) => delivery,
            Err(_) => match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(payload) => Delivery::new("stdin", payload),
                Err(e) => {
                    warn!(error = %e, "Skipping line that is not JSON");
                    continue;
                }
            },
        };
        if tx.send(delivery).await.is_err() {
            break;
        }
    }
    info!("stdin closed");
}

/// Print every report and re-queue deliveries the consumer could not handle yet.
async fn handle_reports(
    mut reports: mpsc::UnboundedReceiver<DeliveryReport>,
    requeue: mpsc::WeakSender<Delivery>,
) {
    while let Some(report) = reports.recv().await {
        match serde_json::to_string(&report) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Failed to serialize delivery report"),
        }

        if report.result.is_settled() {
            continue;
        }
        let mut delivery = report.delivery;
        if delivery.attempt >= MAX_DELIVERY_ATTEMPTS {
            warn!(topic = %delivery.topic, attempt = delivery.attempt, "Giving up on delivery");
            continue;
        }
        delivery.attempt += 1;

        let requeue = requeue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REDELIVERY_DELAY).await;
            match requeue.upgrade() {
                Some(tx) => {
                    let _ = tx.send(delivery).await;
                }
                None => warn!(topic = %delivery.topic, "Consumer gone, redelivery dropped"),
            }
        });
    }
}
